use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex, MutexGuard, PoisonError,
};

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use shared::{
    domain::{EditorRole, UnitId},
    protocol::{Document, Save, SaveSet, UnitOfWork},
};
use tracing::debug;

use crate::{
    codec,
    display::{format_timestamp, DisplayState, DisplayUpdate},
    error::SessionError,
    undo::UndoAffordance,
    version::ResolvedVersion,
    workspace::WorkspaceEngine,
};

pub enum WorkspaceSlot {
    Active(Box<dyn WorkspaceEngine>),
    Disposed,
}

/// Everything the display surface renders for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UiState {
    pub unit_id: UnitId,
    pub role: EditorRole,
    pub active: bool,
    /// "Last saved" text, `M/D/YYYY, h:mm:ss AM/PM`.
    pub last_saved: Option<String>,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub save_set: SaveSet,
    pub last_autosave: Option<Save>,
    pub undo: UndoAffordance,
    pub undo_controls_visible: bool,
}

/// One mounted canvas: the workspace instance it owns plus the persistence
/// state shown next to it.
pub struct Session {
    unit: UnitOfWork,
    role: EditorRole,
    display_offset: FixedOffset,
    workspace: Mutex<WorkspaceSlot>,
    display: Mutex<DisplayState>,
    request_seq: AtomicU64,
    pub(crate) autosave_inflight: AtomicBool,
    pub(crate) manual_save: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(
        unit: UnitOfWork,
        role: EditorRole,
        engine: Box<dyn WorkspaceEngine>,
        display_offset: FixedOffset,
    ) -> Self {
        Self {
            unit,
            role,
            display_offset,
            workspace: Mutex::new(WorkspaceSlot::Active(engine)),
            display: Mutex::new(DisplayState::default()),
            request_seq: AtomicU64::new(0),
            autosave_inflight: AtomicBool::new(false),
            manual_save: tokio::sync::Mutex::new(()),
        }
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit.id
    }

    pub fn unit(&self) -> &UnitOfWork {
        &self.unit
    }

    pub fn role(&self) -> EditorRole {
        self.role
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.slot(), WorkspaceSlot::Active(_))
    }

    fn slot(&self) -> MutexGuard<'_, WorkspaceSlot> {
        self.workspace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn display(&self) -> MutexGuard<'_, DisplayState> {
        self.display.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` against the live workspace. Fails once the session has been
    /// disposed.
    pub fn with_workspace<R>(
        &self,
        f: impl FnOnce(&mut dyn WorkspaceEngine) -> R,
    ) -> Result<R, SessionError> {
        match &mut *self.slot() {
            WorkspaceSlot::Active(engine) => Ok(f(&mut **engine)),
            WorkspaceSlot::Disposed => Err(SessionError::NotActive),
        }
    }

    pub fn encode_workspace(&self) -> Result<Document, SessionError> {
        self.with_workspace(|engine| codec::encode(&engine.snapshot()))
    }

    /// Claims the next request sequence. Every save request and version load
    /// takes one before touching the display.
    pub fn next_request_seq(&self) -> u64 {
        self.request_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Replaces the workspace contents with `version`. The document is decoded
    /// before anything is cleared, so a malformed one leaves the canvas as it
    /// was. Change events are suppressed during the swap and undo history is
    /// dropped afterwards.
    pub fn load_version(&self, version: &ResolvedVersion) -> Result<DisplayUpdate, SessionError> {
        let state = codec::decode(&version.document)?;
        self.with_workspace(move |engine| {
            engine.set_events_enabled(false);
            engine.clear();
            engine.load(state);
            engine.clear_undo();
            engine.set_events_enabled(true);
        })?;
        let seq = self.next_request_seq();
        Ok(self.display().apply_saved(seq, version.last_saved))
    }

    /// Records the response to save request `seq`.
    pub fn record_save(&self, seq: u64, save: &Save, autosave: bool) -> DisplayUpdate {
        let mut display = self.display();
        if autosave {
            display.last_autosave = Some(save.clone());
        }
        let update = display.apply_saved(seq, Some(save.updated_at));
        if update == DisplayUpdate::Stale {
            debug!(
                "session: stale save response unit={} save={} seq={}",
                self.unit.id.0, save.id.0, seq
            );
        }
        update
    }

    pub fn set_save_set(&self, saves: SaveSet) {
        self.display().save_set = saves;
    }

    pub fn save_set(&self) -> SaveSet {
        self.display().save_set.clone()
    }

    pub fn undo_affordance(&self) -> UndoAffordance {
        self.with_workspace(|engine| UndoAffordance::of(engine))
            .unwrap_or_default()
    }

    pub fn ui_state(&self) -> UiState {
        let undo = self.undo_affordance();
        let active = self.is_active();
        let display = self.display();
        let last_saved_at = display.last_saved();
        UiState {
            unit_id: self.unit.id,
            role: self.role,
            active,
            last_saved: last_saved_at.map(|at| format_timestamp(at, self.display_offset)),
            last_saved_at,
            save_set: display.save_set.clone(),
            last_autosave: display.last_autosave.clone(),
            undo,
            undo_controls_visible: self.role.shows_undo_controls(),
        }
    }

    /// Disposes the workspace. Returns false when it was already disposed.
    pub fn dispose(&self) -> bool {
        let previous = std::mem::replace(&mut *self.slot(), WorkspaceSlot::Disposed);
        match previous {
            WorkspaceSlot::Active(mut engine) => {
                engine.dispose();
                true
            }
            WorkspaceSlot::Disposed => false,
        }
    }
}

/// Holds the autosave in-flight flag for the duration of one tick.
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
