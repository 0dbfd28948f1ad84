use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use shared::{
    domain::EditorRole,
    protocol::{Save, SaveSet, UnitOfWork},
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        Mutex,
    },
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

pub mod codec;
pub mod config;
pub mod display;
pub mod error;
pub mod sandbox;
pub mod session;
pub mod store;
pub mod tasks;
pub mod undo;
pub mod version;
pub mod workspace;

pub use config::SessionSettings;
pub use display::DisplayUpdate;
pub use error::SessionError;
pub use session::{Session, UiState};
pub use version::VersionToken;

use sandbox::{FileSandboxCache, MemorySandboxCache, SandboxCache};
use session::InFlight;
use store::{HttpSaveStore, MissingSaveStore, SaveStore};
use tasks::TaskQueue;
use workspace::{WorkspaceChange, WorkspaceFactory};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub const SAVE_SUCCEEDED_NOTICE: &str = "Workspace saved successfully.";
pub const RESTORE_FAILED_NOTICE: &str = "Failed to restore save.";
pub const LOAD_FAILED_NOTICE: &str = "Failed to load save.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Error,
}

/// Transient user-facing message, the equivalent of a toast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(UiState),
    Notice(Notice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RoleIneligible,
    NoSession,
    InFlight,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutosaveOutcome {
    Skipped(SkipReason),
    Saved { save: Save, display: DisplayUpdate },
    Failed,
}

struct ActiveSession {
    session: Arc<Session>,
    listener_task: JoinHandle<()>,
    autosave_task: Option<JoinHandle<()>>,
}

/// Drives the one editing session of a mounted canvas: mount, autosave,
/// manual save, version restore, undo/redo and teardown.
pub struct SessionController {
    store: Arc<dyn SaveStore>,
    factory: Arc<dyn WorkspaceFactory>,
    sandbox_cache: Arc<dyn SandboxCache>,
    settings: SessionSettings,
    tasks: TaskQueue,
    active: Mutex<Option<ActiveSession>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    /// Controller without persistence. Must be called inside a tokio runtime,
    /// as are the other constructors.
    pub fn new(settings: SessionSettings, factory: Arc<dyn WorkspaceFactory>) -> Arc<Self> {
        Self::new_with_dependencies(
            settings,
            Arc::new(MissingSaveStore),
            factory,
            Arc::new(MemorySandboxCache::new()),
        )
    }

    /// Controller talking to the save store at `settings.server_url`.
    pub fn from_settings(
        settings: SessionSettings,
        factory: Arc<dyn WorkspaceFactory>,
    ) -> anyhow::Result<Arc<Self>> {
        let store = HttpSaveStore::new(&settings.server_url)?;
        let sandbox_cache: Arc<dyn SandboxCache> = match &settings.sandbox_cache_path {
            Some(path) => Arc::new(FileSandboxCache::new(path)),
            None => Arc::new(MemorySandboxCache::new()),
        };
        Ok(Self::new_with_dependencies(
            settings,
            Arc::new(store),
            factory,
            sandbox_cache,
        ))
    }

    pub fn new_with_dependencies(
        settings: SessionSettings,
        store: Arc<dyn SaveStore>,
        factory: Arc<dyn WorkspaceFactory>,
        sandbox_cache: Arc<dyn SandboxCache>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            store,
            factory,
            sandbox_cache,
            settings,
            tasks: TaskQueue::start(),
            active: Mutex::new(None),
            events,
        })
    }

    /// Binds a fresh workspace to `unit`. Re-initializing the bound unit is a
    /// no-op; binding a different unit requires a teardown first.
    pub async fn initialize(
        self: &Arc<Self>,
        unit: UnitOfWork,
        role: EditorRole,
    ) -> Result<UiState, SessionError> {
        let mut active = self.active.lock().await;
        if let Some(bound) = active.as_ref() {
            let bound_unit = bound.session.unit_id();
            if bound_unit == unit.id {
                debug!("session: already bound unit={}", unit.id.0);
                return Ok(bound.session.ui_state());
            }
            return Err(SessionError::AlreadyBound {
                active: bound_unit,
                requested: unit.id,
            });
        }

        let saves = if role.has_save_history() {
            match self.store.fetch_save_set(unit.id).await {
                Ok(saves) => saves,
                Err(err) => {
                    warn!(
                        "session: save history unavailable unit={} err={err:#}",
                        unit.id.0
                    );
                    SaveSet::default()
                }
            }
        } else {
            SaveSet::default()
        };

        let cached = if role.mirrors_to_sandbox() {
            self.sandbox_cache.load().unwrap_or_else(|err| {
                warn!("session: sandbox cache unreadable err={err:#}");
                None
            })
        } else {
            None
        };

        let initial = version::initial_version(role, &saves, cached, unit.template.as_ref());
        let session = Arc::new(Session::new(
            unit,
            role,
            self.factory.create(),
            self.settings.display_offset,
        ));
        session.set_save_set(saves);
        if let Err(err) = session.load_version(&initial) {
            warn!(
                "session: initial document unreadable unit={} source={:?} err={err}",
                session.unit_id().0,
                initial.source
            );
            self.notify(NoticeLevel::Error, LOAD_FAILED_NOTICE);
        }

        let changes = session.with_workspace(|engine| engine.subscribe_changes())?;
        let listener_task = self.spawn_change_listener(Arc::clone(&session), changes);
        let autosave_task = role.autosaves().then(|| self.spawn_autosave_timer());

        info!(
            "session: initialized unit={} role={:?} source={:?}",
            session.unit_id().0,
            role,
            initial.source
        );
        let state = session.ui_state();
        *active = Some(ActiveSession {
            session,
            listener_task,
            autosave_task,
        });
        drop(active);

        let _ = self.events.send(SessionEvent::StateChanged(state.clone()));
        Ok(state)
    }

    /// One autosave timer tick. Only a student editor autosaves, and a tick
    /// that lands while the previous one is still waiting on the store is
    /// skipped. Failures are logged and never reach the user.
    pub async fn autosave_tick(&self) -> AutosaveOutcome {
        let Some(session) = self.session().await else {
            return AutosaveOutcome::Skipped(SkipReason::NoSession);
        };
        if !session.role().autosaves() {
            return AutosaveOutcome::Skipped(SkipReason::RoleIneligible);
        }
        let Some(_inflight) = InFlight::acquire(&session.autosave_inflight) else {
            debug!("autosave: previous save still pending unit={}", session.unit_id().0);
            return AutosaveOutcome::Skipped(SkipReason::InFlight);
        };
        let Ok(document) = session.encode_workspace() else {
            return AutosaveOutcome::Skipped(SkipReason::NoSession);
        };

        let seq = session.next_request_seq();
        match self.store.create_save(session.unit_id(), &document).await {
            Ok(save) => {
                let update = session.record_save(seq, &save, true);
                info!(
                    "autosave: stored unit={} save={} display={:?}",
                    save.unit_id.0, save.id.0, update
                );
                let _ = self
                    .events
                    .send(SessionEvent::StateChanged(session.ui_state()));
                AutosaveOutcome::Saved {
                    save,
                    display: update,
                }
            }
            Err(err) => {
                warn!("autosave: failed unit={} err={err:#}", session.unit_id().0);
                AutosaveOutcome::Failed
            }
        }
    }

    /// Saves the workspace and refreshes the version history. Manual saves
    /// queue behind each other.
    pub async fn manual_save(&self) -> Result<UiState, SessionError> {
        let session = self.session().await.ok_or(SessionError::NotActive)?;
        let _queued = session.manual_save.lock().await;
        let document = session.encode_workspace()?;
        let unit_id = session.unit_id();

        let seq = session.next_request_seq();
        let save = match self.store.create_save(unit_id, &document).await {
            Ok(save) => save,
            Err(source) => {
                warn!("save: failed unit={} err={source:#}", unit_id.0);
                self.notify(NoticeLevel::Error, format!("{source:#}"));
                return Err(SessionError::store(source));
            }
        };
        session.record_save(seq, &save, false);
        info!("save: stored unit={} save={}", unit_id.0, save.id.0);
        self.notify(NoticeLevel::Success, SAVE_SUCCEEDED_NOTICE);

        match self.store.fetch_save_set(unit_id).await {
            Ok(saves) => session.set_save_set(saves),
            Err(err) => warn!(
                "save: history refresh failed unit={} err={err:#}",
                unit_id.0
            ),
        }

        let state = session.ui_state();
        let _ = self.events.send(SessionEvent::StateChanged(state.clone()));
        Ok(state)
    }

    /// Loads the template or a recorded save into the workspace.
    pub async fn select_version(&self, token: VersionToken) -> Result<UiState, SessionError> {
        let session = self.session().await.ok_or(SessionError::NotActive)?;
        let saves = session.save_set();
        let resolved = match version::resolve(
            token,
            &saves,
            session.unit().template.as_ref(),
            session.unit_id(),
        ) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!("restore: {err}");
                self.notify(NoticeLevel::Error, RESTORE_FAILED_NOTICE);
                return Err(err);
            }
        };

        if let Err(err) = session.load_version(&resolved) {
            warn!(
                "restore: load failed unit={} source={:?} err={err}",
                session.unit_id().0,
                resolved.source
            );
            self.notify(NoticeLevel::Error, LOAD_FAILED_NOTICE);
            return Err(err);
        }
        info!(
            "restore: loaded unit={} source={:?}",
            session.unit_id().0,
            resolved.source
        );

        let state = session.ui_state();
        let _ = self.events.send(SessionEvent::StateChanged(state.clone()));
        Ok(state)
    }

    pub async fn undo(&self) -> Result<UiState, SessionError> {
        let session = self.session().await.ok_or(SessionError::NotActive)?;
        undo::undo(&session)?;
        Ok(session.ui_state())
    }

    pub async fn redo(&self) -> Result<UiState, SessionError> {
        let session = self.session().await.ok_or(SessionError::NotActive)?;
        undo::redo(&session)?;
        Ok(session.ui_state())
    }

    /// Unbinds the session. A student editor's workspace is handed to the
    /// task queue for one last best-effort save before it is disposed.
    /// Returns false when nothing was bound.
    pub async fn teardown(&self) -> bool {
        self.unbind(true).await
    }

    /// Unbinds the session without the unmount save, for hosts that only
    /// inspect a unit.
    pub async fn release(&self) -> bool {
        self.unbind(false).await
    }

    async fn unbind(&self, unmount_save: bool) -> bool {
        let Some(active) = self.active.lock().await.take() else {
            return false;
        };
        active.listener_task.abort();
        if let Some(task) = active.autosave_task {
            task.abort();
        }

        let session = active.session;
        let unit_id = session.unit_id();
        if unmount_save && session.role().has_save_history() {
            match session.encode_workspace() {
                Ok(document) => {
                    let store = Arc::clone(&self.store);
                    let queued = self.tasks.submit("teardown-save", async move {
                        let save = store
                            .create_save(unit_id, &document)
                            .await
                            .with_context(|| format!("teardown save for unit {}", unit_id.0))?;
                        info!(
                            "session: teardown save stored unit={} save={}",
                            unit_id.0, save.id.0
                        );
                        Ok(())
                    });
                    if let Err(err) = queued {
                        warn!("session: teardown save dropped unit={} err={err:#}", unit_id.0);
                    }
                }
                Err(err) => warn!("session: teardown snapshot failed unit={} err={err}", unit_id.0),
            }
        }

        session.dispose();
        info!("session: torn down unit={}", unit_id.0);
        let _ = self
            .events
            .send(SessionEvent::StateChanged(session.ui_state()));
        true
    }

    pub async fn session(&self) -> Option<Arc<Session>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.session))
    }

    pub async fn state(&self) -> Option<UiState> {
        self.session().await.map(|session| session.ui_state())
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let _ = self.events.send(SessionEvent::Notice(Notice {
            level,
            message: message.into(),
        }));
    }

    fn spawn_change_listener(
        &self,
        session: Arc<Session>,
        mut changes: broadcast::Receiver<WorkspaceChange>,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        let sandbox_cache = Arc::clone(&self.sandbox_cache);
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("session: change listener lagged skipped={skipped}")
                    }
                    Err(RecvError::Closed) => break,
                }

                if session.role().mirrors_to_sandbox() {
                    let Ok(document) = session.encode_workspace() else {
                        break;
                    };
                    if let Err(err) = sandbox_cache.store(&document) {
                        warn!("session: sandbox mirror failed err={err:#}");
                    }
                }
                if session.role().shows_undo_controls() {
                    let _ = events.send(SessionEvent::StateChanged(session.ui_state()));
                }
            }
        })
    }

    fn spawn_autosave_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::downgrade(self);
        let period = self.settings.autosave_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.autosave_tick().await;
            }
        })
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.listener_task.abort();
            if let Some(task) = active.autosave_task {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
