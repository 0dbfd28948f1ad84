use super::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{SaveId, UnitId},
    protocol::Document,
};
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use tokio::sync::oneshot;

use crate::{
    codec::{encode, Block, WorkspaceState},
    sandbox::MemorySandboxCache,
    workspace::{MemoryWorkspace, MemoryWorkspaceFactory, WorkspaceEngine},
};

const UNIT: UnitId = UnitId(7);

fn stamp(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 10, minute, 0)
        .single()
        .expect("timestamp")
}

fn template_state() -> WorkspaceState {
    WorkspaceState {
        blocks: vec![Block::new("setup", "arduino_setup")],
    }
}

fn saved_state() -> WorkspaceState {
    WorkspaceState {
        blocks: vec![Block::new("loop", "arduino_loop")
            .with_child(Block::new("wait", "delay").with_field("MS", "250"))],
    }
}

fn unit(template: Option<WorkspaceState>) -> UnitOfWork {
    UnitOfWork {
        id: UNIT,
        name: "blink".into(),
        template: template.map(|state| encode(&state)),
    }
}

fn seeded_save(id: i64, workspace: Document, updated_at: DateTime<Utc>) -> Save {
    Save {
        id: SaveId(id),
        unit_id: UNIT,
        workspace,
        updated_at,
    }
}

/// In-memory save store. Created saves get ids from 100 and timestamps
/// from 10:01 onward in request order; a queued gate holds the matching
/// `create_save` response until it is released.
#[derive(Default)]
struct TestSaveStore {
    saves: Mutex<Vec<Save>>,
    create_gates: Mutex<VecDeque<oneshot::Receiver<()>>>,
    requests: AtomicUsize,
    fetches: AtomicUsize,
    fail_creates: AtomicBool,
    fail_fetches: AtomicBool,
}

impl TestSaveStore {
    fn with_saves(saves: Vec<Save>) -> Self {
        Self {
            saves: Mutex::new(saves),
            ..Self::default()
        }
    }

    fn failing_creates(self) -> Self {
        self.fail_creates.store(true, Ordering::SeqCst);
        self
    }

    async fn gate_next_create(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.create_gates.lock().await.push_back(rx);
        tx
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SaveStore for TestSaveStore {
    async fn fetch_save_set(&self, unit_id: UnitId) -> Result<SaveSet> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(anyhow!("save store offline"));
        }
        let saves = self.saves.lock().await;
        let mut newest_first = saves
            .iter()
            .rev()
            .filter(|save| save.unit_id == unit_id)
            .cloned();
        Ok(SaveSet {
            current: newest_first.next(),
            past: newest_first.collect(),
        })
    }

    async fn create_save(&self, unit_id: UnitId, workspace: &Document) -> Result<Save> {
        let gate = self.create_gates.lock().await.pop_front();
        let ordinal = self.requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(anyhow!("save store offline"));
        }
        let save = Save {
            id: SaveId(100 + ordinal as i64),
            unit_id,
            workspace: workspace.clone(),
            updated_at: stamp(ordinal as u32 + 1),
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.saves.lock().await.push(save.clone());
        Ok(save)
    }

    async fn fetch_unit(&self, unit_id: UnitId) -> Result<UnitOfWork> {
        Ok(UnitOfWork {
            id: unit_id,
            name: "blink".into(),
            template: None,
        })
    }
}

struct Harness {
    controller: Arc<SessionController>,
    store: Arc<TestSaveStore>,
    factory: Arc<MemoryWorkspaceFactory>,
    sandbox: Arc<MemorySandboxCache>,
}

impl Harness {
    fn new(store: TestSaveStore) -> Self {
        let store = Arc::new(store);
        let factory = Arc::new(MemoryWorkspaceFactory::new());
        let sandbox = Arc::new(MemorySandboxCache::new());
        let controller = SessionController::new_with_dependencies(
            SessionSettings::default(),
            store.clone(),
            factory.clone(),
            sandbox.clone(),
        );
        Self {
            controller,
            store,
            factory,
            sandbox,
        }
    }

    fn canvas(&self) -> MemoryWorkspace {
        self.factory.last_created().expect("canvas created")
    }
}

fn store_with_current_save() -> TestSaveStore {
    TestSaveStore::with_saves(vec![seeded_save(
        1,
        encode(&saved_state()),
        "2024-01-01T10:00:00Z".parse().expect("timestamp"),
    )])
}

async fn wait_for_requests(store: &TestSaveStore, count: usize) {
    for _ in 0..1000 {
        if store.requests() >= count {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("store saw {} requests, expected {count}", store.requests());
}

async fn next_notice(events: &mut broadcast::Receiver<SessionEvent>) -> Notice {
    loop {
        match time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(SessionEvent::Notice(notice))) => return notice,
            Ok(Ok(_)) => continue,
            other => panic!("expected a notice, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn student_mount_loads_current_save() {
    let harness = Harness::new(store_with_current_save());

    let state = harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::StudentEditor)
        .await
        .expect("initialize");

    let canvas = harness.canvas();
    assert_eq!(canvas.snapshot(), saved_state());
    assert_eq!(state.last_saved.as_deref(), Some("1/1/2024, 10:00:00 AM"));
    assert_eq!(canvas.undo_len(), 0);
    assert_eq!(state.undo, undo::UndoAffordance::default());
    assert_eq!(
        state.save_set.current.map(|save| save.id),
        Some(SaveId(1))
    );
    assert!(state.undo_controls_visible);
}

#[tokio::test]
async fn undo_history_is_empty_after_any_initial_load() {
    let cases = [
        (TestSaveStore::default(), Some(template_state()), template_state()),
        (store_with_current_save(), None, saved_state()),
        (TestSaveStore::default(), None, WorkspaceState::default()),
    ];
    for (store, template, expected) in cases {
        let harness = Harness::new(store);
        let state = harness
            .controller
            .initialize(unit(template), EditorRole::StudentEditor)
            .await
            .expect("initialize");

        let canvas = harness.canvas();
        assert_eq!(canvas.snapshot(), expected);
        assert_eq!(canvas.undo_len(), 0);
        assert_eq!(canvas.redo_len(), 0);
        assert!(!state.undo.can_undo);
    }
}

#[tokio::test]
async fn autosave_never_runs_for_other_roles() {
    for role in [EditorRole::Sandbox, EditorRole::Viewer] {
        let harness = Harness::new(TestSaveStore::default());
        harness
            .controller
            .initialize(unit(Some(template_state())), role)
            .await
            .expect("initialize");
        assert!(harness.canvas().add_block(None, Block::new("led", "digital_write")));

        assert_eq!(
            harness.controller.autosave_tick().await,
            AutosaveOutcome::Skipped(SkipReason::RoleIneligible)
        );
        assert_eq!(harness.store.requests(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn autosave_timer_fires_every_interval_for_students() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::StudentEditor)
        .await
        .expect("initialize");

    time::sleep(Duration::from_secs(59)).await;
    assert_eq!(harness.store.requests(), 0);

    time::sleep(Duration::from_secs(2)).await;
    tokio::task::yield_now().await;
    assert_eq!(harness.store.requests(), 1);

    time::sleep(Duration::from_secs(60)).await;
    tokio::task::yield_now().await;
    assert_eq!(harness.store.requests(), 2);

    let state = harness.controller.state().await.expect("state");
    assert_eq!(state.last_autosave.map(|save| save.id), Some(SaveId(101)));
}

#[tokio::test(start_paused = true)]
async fn autosave_timer_stays_quiet_for_sandbox() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(None), EditorRole::Sandbox)
        .await
        .expect("initialize");

    time::sleep(Duration::from_secs(600)).await;
    assert_eq!(harness.store.requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn teardown_stops_the_autosave_timer() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    assert!(harness.controller.teardown().await);
    harness.controller.tasks().flush().await;
    let after_teardown = harness.store.requests();

    time::sleep(Duration::from_secs(300)).await;
    assert_eq!(harness.store.requests(), after_teardown);
}

#[tokio::test]
async fn autosave_records_last_autosave_and_display() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    assert!(harness.canvas().add_block(None, Block::new("led", "digital_write")));

    let (save, display) = match harness.controller.autosave_tick().await {
        AutosaveOutcome::Saved { save, display } => (save, display),
        other => panic!("expected a save, got {other:?}"),
    };
    assert_eq!(display, DisplayUpdate::Applied);
    assert_eq!(save.workspace, encode(&harness.canvas().snapshot()));

    let state = harness.controller.state().await.expect("state");
    assert_eq!(state.last_autosave, Some(save.clone()));
    assert_eq!(state.last_saved_at, Some(save.updated_at));
    assert_eq!(state.last_saved.as_deref(), Some("1/1/2024, 10:01:00 AM"));
}

#[tokio::test]
async fn autosave_failure_is_swallowed() {
    let harness = Harness::new(store_with_current_save().failing_creates());
    let mut events = harness.controller.subscribe_events();
    let mounted = harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("initialize");

    assert_eq!(
        harness.controller.autosave_tick().await,
        AutosaveOutcome::Failed
    );
    let state = harness.controller.state().await.expect("state");
    assert_eq!(state.last_saved, mounted.last_saved);
    assert!(state.last_autosave.is_none());

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::Notice(_)));
    }
    assert!(harness.canvas().add_block(None, Block::new("led", "digital_write")));
}

#[tokio::test]
async fn overlapping_autosave_is_coalesced() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    let release = harness.store.gate_next_create().await;

    let controller = Arc::clone(&harness.controller);
    let pending = tokio::spawn(async move { controller.autosave_tick().await });
    wait_for_requests(&harness.store, 1).await;

    assert_eq!(
        harness.controller.autosave_tick().await,
        AutosaveOutcome::Skipped(SkipReason::InFlight)
    );

    let _ = release.send(());
    let outcome = pending.await.expect("autosave task");
    assert!(matches!(outcome, AutosaveOutcome::Saved { .. }));
    assert_eq!(harness.store.requests(), 1);

    assert!(matches!(
        harness.controller.autosave_tick().await,
        AutosaveOutcome::Saved { .. }
    ));
}

#[tokio::test]
async fn newer_save_wins_when_responses_arrive_out_of_order() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    let release_first = harness.store.gate_next_create().await;
    let release_second = harness.store.gate_next_create().await;

    let controller = Arc::clone(&harness.controller);
    let autosave = tokio::spawn(async move { controller.autosave_tick().await });
    wait_for_requests(&harness.store, 1).await;

    let controller = Arc::clone(&harness.controller);
    let manual = tokio::spawn(async move { controller.manual_save().await });
    wait_for_requests(&harness.store, 2).await;

    let _ = release_second.send(());
    let after_manual = manual
        .await
        .expect("manual task")
        .expect("manual save");
    assert_eq!(after_manual.last_saved_at, Some(stamp(2)));

    let _ = release_first.send(());
    let (save, display) = match autosave.await.expect("autosave task") {
        AutosaveOutcome::Saved { save, display } => (save, display),
        other => panic!("expected a save, got {other:?}"),
    };
    assert_eq!(save.updated_at, stamp(1));
    assert_eq!(display, DisplayUpdate::Stale);

    let state = harness.controller.state().await.expect("state");
    assert_eq!(state.last_saved_at, Some(stamp(2)));
    assert_eq!(state.last_saved.as_deref(), Some("1/1/2024, 10:02:00 AM"));
    assert_eq!(state.last_autosave.map(|save| save.id), Some(SaveId(100)));
}

#[tokio::test]
async fn manual_save_updates_display_and_refreshes_history() {
    let harness = Harness::new(store_with_current_save());
    let mut events = harness.controller.subscribe_events();
    harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    assert!(harness.canvas().set_field("wait", "MS", "100"));

    let state = harness.controller.manual_save().await.expect("manual save");

    let current = state.save_set.current.clone().expect("current save");
    assert_eq!(current.id, SaveId(100));
    assert_eq!(current.workspace, encode(&harness.canvas().snapshot()));
    assert_eq!(
        state.save_set.past.iter().map(|save| save.id).collect::<Vec<_>>(),
        vec![SaveId(1)]
    );
    assert_eq!(state.last_saved_at, Some(current.updated_at));

    let notice = next_notice(&mut events).await;
    assert_eq!(notice.level, NoticeLevel::Success);
    assert_eq!(notice.message, SAVE_SUCCEEDED_NOTICE);
}

#[tokio::test]
async fn manual_save_failure_keeps_display_and_history() {
    let harness = Harness::new(store_with_current_save().failing_creates());
    let mounted = harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    let mut events = harness.controller.subscribe_events();
    let fetches_before = harness.store.fetches();

    let err = harness
        .controller
        .manual_save()
        .await
        .expect_err("store offline");
    assert!(matches!(err, SessionError::StoreUnavailable { .. }));

    let notice = next_notice(&mut events).await;
    assert_eq!(notice.level, NoticeLevel::Error);
    assert!(notice.message.contains("offline"));

    let state = harness.controller.state().await.expect("state");
    assert_eq!(state.last_saved, mounted.last_saved);
    assert_eq!(state.save_set, mounted.save_set);
    assert_eq!(harness.store.fetches(), fetches_before);
}

#[tokio::test]
async fn template_selection_clears_display_and_history() {
    let harness = Harness::new(store_with_current_save());
    harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    let canvas = harness.canvas();
    assert!(canvas.add_block(Some("loop"), Block::new("led", "digital_write")));
    assert!(canvas.undo_len() > 0);

    let state = harness
        .controller
        .select_version(VersionToken::from_wire(-1))
        .await
        .expect("template");

    assert_eq!(canvas.snapshot(), template_state());
    assert_eq!(state.last_saved, None);
    assert_eq!(canvas.undo_len(), 0);
    assert_eq!(canvas.redo_len(), 0);
    assert!(!state.undo.can_undo);
}

#[tokio::test]
async fn past_save_restores_with_its_timestamp() {
    let harness = Harness::new(TestSaveStore::with_saves(vec![
        seeded_save(1, encode(&template_state()), stamp(0)),
        seeded_save(2, encode(&saved_state()), stamp(30)),
    ]));
    harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    assert_eq!(harness.canvas().snapshot(), saved_state());

    let state = harness
        .controller
        .select_version(VersionToken::Save(SaveId(1)))
        .await
        .expect("restore");

    assert_eq!(harness.canvas().snapshot(), template_state());
    assert_eq!(state.last_saved.as_deref(), Some("1/1/2024, 10:00:00 AM"));
}

#[tokio::test]
async fn unknown_save_is_restore_not_found() {
    let harness = Harness::new(store_with_current_save());
    harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    let canvas = harness.canvas();
    assert!(canvas.set_field("wait", "MS", "900"));
    let before = canvas.snapshot();
    let mut events = harness.controller.subscribe_events();

    let err = harness
        .controller
        .select_version(VersionToken::Save(SaveId(999)))
        .await
        .expect_err("unknown save");

    assert!(matches!(
        err,
        SessionError::RestoreNotFound {
            save_id: SaveId(999),
            ..
        }
    ));
    assert_eq!(canvas.snapshot(), before);
    assert_eq!(canvas.undo_len(), 1);
    assert_eq!(next_notice(&mut events).await.message, RESTORE_FAILED_NOTICE);
}

#[tokio::test]
async fn malformed_save_leaves_workspace_untouched() {
    let harness = Harness::new(TestSaveStore::with_saves(vec![
        seeded_save(1, Document::new("<xml>not a block tree"), stamp(0)),
        seeded_save(2, encode(&saved_state()), stamp(30)),
    ]));
    harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    let mut events = harness.controller.subscribe_events();
    let before = harness.controller.state().await.expect("state");

    let err = harness
        .controller
        .select_version(VersionToken::Save(SaveId(1)))
        .await
        .expect_err("malformed save");

    assert!(matches!(err, SessionError::LoadFailed(_)));
    assert_eq!(harness.canvas().snapshot(), saved_state());
    let after = harness.controller.state().await.expect("state");
    assert_eq!(after.last_saved, before.last_saved);
    assert_eq!(next_notice(&mut events).await.message, LOAD_FAILED_NOTICE);
}

#[tokio::test]
async fn malformed_initial_document_starts_empty() {
    let harness = Harness::new(TestSaveStore::with_saves(vec![seeded_save(
        1,
        Document::new("{\"version\":1,\"blocks\":[{\"id\":\"\"}]}"),
        stamp(0),
    )]));
    let mut events = harness.controller.subscribe_events();

    let state = harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::StudentEditor)
        .await
        .expect("initialize");

    assert!(harness.canvas().snapshot().is_empty());
    assert_eq!(state.last_saved, None);
    assert!(state.active);
    assert_eq!(next_notice(&mut events).await.message, LOAD_FAILED_NOTICE);
}

#[tokio::test]
async fn history_fetch_failure_falls_back_to_template() {
    let store = store_with_current_save();
    store.fail_fetches.store(true, Ordering::SeqCst);
    let harness = Harness::new(store);

    let state = harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::StudentEditor)
        .await
        .expect("initialize");

    assert_eq!(harness.canvas().snapshot(), template_state());
    assert!(state.save_set.is_empty());
    assert_eq!(state.last_saved, None);
}

#[tokio::test]
async fn undo_on_empty_stack_changes_nothing() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::Sandbox)
        .await
        .expect("initialize");
    let canvas = harness.canvas();

    let state = harness.controller.undo().await.expect("undo");
    assert_eq!(canvas.snapshot(), template_state());
    assert_eq!((canvas.undo_len(), canvas.redo_len()), (0, 0));
    assert_eq!(state.undo, undo::UndoAffordance::default());

    harness.controller.redo().await.expect("redo");
    assert_eq!(canvas.snapshot(), template_state());
}

#[tokio::test]
async fn undo_and_redo_step_through_edits() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    let canvas = harness.canvas();
    assert!(canvas.add_block(Some("setup"), Block::new("pin", "pin_mode")));

    let state = harness.controller.undo().await.expect("undo");
    assert_eq!(canvas.snapshot(), template_state());
    assert!(!state.undo.can_undo);
    assert!(state.undo.can_redo);

    let state = harness.controller.redo().await.expect("redo");
    assert_eq!(canvas.snapshot().block_count(), 2);
    assert!(state.undo.can_undo);
    assert!(!state.undo.can_redo);
}

#[tokio::test]
async fn edits_publish_refreshed_undo_state() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    let mut events = harness.controller.subscribe_events();

    assert!(harness.canvas().add_block(None, Block::new("led", "digital_write")));

    loop {
        match time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(SessionEvent::StateChanged(state))) if state.undo.can_undo => break,
            Ok(Ok(_)) => continue,
            other => panic!("expected refreshed state, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn sandbox_edits_are_mirrored_to_cache() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::Sandbox)
        .await
        .expect("initialize");
    assert!(harness.sandbox.load().expect("load").is_none());

    let canvas = harness.canvas();
    assert!(canvas.add_block(Some("setup"), Block::new("pin", "pin_mode")));
    let expected = encode(&canvas.snapshot());

    for _ in 0..1000 {
        if harness.sandbox.load().expect("load").as_ref() == Some(&expected) {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("sandbox cache never caught up");
}

#[tokio::test]
async fn student_edits_are_not_mirrored() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    assert!(harness.canvas().add_block(None, Block::new("led", "digital_write")));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(harness.sandbox.load().expect("load").is_none());
}

#[tokio::test]
async fn sandbox_mount_restores_cached_canvas() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .sandbox
        .store(&encode(&saved_state()))
        .expect("seed cache");

    harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::Sandbox)
        .await
        .expect("initialize");

    assert_eq!(harness.canvas().snapshot(), saved_state());
    assert_eq!(harness.store.fetches(), 0);
}

#[tokio::test]
async fn initialize_is_idempotent_for_the_bound_unit() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    assert!(harness.canvas().add_block(None, Block::new("led", "digital_write")));

    harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::StudentEditor)
        .await
        .expect("re-initialize");
    assert_eq!(harness.factory.created_count(), 1);
    assert_eq!(harness.canvas().snapshot().block_count(), 2);

    let mut other = unit(None);
    other.id = UnitId(8);
    let err = harness
        .controller
        .initialize(other, EditorRole::StudentEditor)
        .await
        .expect_err("different unit");
    assert!(matches!(
        err,
        SessionError::AlreadyBound {
            active: UNIT,
            requested: UnitId(8)
        }
    ));
}

#[tokio::test]
async fn teardown_saves_student_workspace_once() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    let canvas = harness.canvas();
    assert!(canvas.add_block(Some("setup"), Block::new("pin", "pin_mode")));
    let expected = encode(&canvas.snapshot());

    assert!(harness.controller.teardown().await);
    assert!(!harness.controller.teardown().await);
    harness.controller.tasks().flush().await;

    assert_eq!(harness.store.requests(), 1);
    let stored = harness.store.saves.lock().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].workspace, expected);
    assert!(canvas.is_disposed());
    assert!(harness.controller.session().await.is_none());
}

#[tokio::test]
async fn release_unbinds_without_unmount_save() {
    let harness = Harness::new(store_with_current_save());
    harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    let canvas = harness.canvas();

    assert!(harness.controller.release().await);
    assert!(!harness.controller.teardown().await);
    harness.controller.tasks().flush().await;

    assert_eq!(harness.store.requests(), 0);
    assert!(canvas.is_disposed());
    assert!(harness.controller.session().await.is_none());
}

#[tokio::test]
async fn refused_duplicate_edits_do_not_break_the_next_mount() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::StudentEditor)
        .await
        .expect("initialize");
    let canvas = harness.canvas();
    let stack = |id: &str| Block::new(id, "arduino_loop").with_child(Block::new("wait", "delay"));
    assert!(canvas.add_block(None, stack("a")));
    assert!(!canvas.add_block(None, stack("c")));
    assert!(!canvas.add_block(None, Block::new("x", "")));
    let expected = canvas.snapshot();

    harness.controller.manual_save().await.expect("save");
    assert!(harness.controller.teardown().await);
    harness.controller.tasks().flush().await;

    harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::StudentEditor)
        .await
        .expect("remount");
    let remounted = harness.canvas().snapshot();
    assert_eq!(remounted.block_count(), 3);
    assert_eq!(remounted, expected);
}

#[tokio::test]
async fn teardown_save_failure_is_swallowed() {
    let harness = Harness::new(TestSaveStore::default().failing_creates());
    harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("initialize");

    assert!(harness.controller.teardown().await);
    harness.controller.tasks().flush().await;
    assert_eq!(harness.store.requests(), 1);

    harness
        .controller
        .initialize(unit(None), EditorRole::StudentEditor)
        .await
        .expect("rebind after teardown");
    assert_eq!(harness.factory.created_count(), 2);
}

#[tokio::test]
async fn viewer_teardown_does_not_save() {
    let harness = Harness::new(TestSaveStore::default());
    harness
        .controller
        .initialize(unit(Some(template_state())), EditorRole::Viewer)
        .await
        .expect("initialize");

    assert!(harness.controller.teardown().await);
    harness.controller.tasks().flush().await;
    assert_eq!(harness.store.requests(), 0);
    assert!(harness.canvas().is_disposed());
}

#[tokio::test]
async fn operations_without_a_session() {
    let harness = Harness::new(TestSaveStore::default());

    assert_eq!(
        harness.controller.autosave_tick().await,
        AutosaveOutcome::Skipped(SkipReason::NoSession)
    );
    assert!(matches!(
        harness.controller.manual_save().await,
        Err(SessionError::NotActive)
    ));
    assert!(matches!(
        harness.controller.select_version(VersionToken::Template).await,
        Err(SessionError::NotActive)
    ));
    assert!(matches!(
        harness.controller.undo().await,
        Err(SessionError::NotActive)
    ));
    assert!(!harness.controller.teardown().await);
    assert!(harness.controller.state().await.is_none());
}
