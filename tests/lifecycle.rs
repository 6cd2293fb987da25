use player_state_bridge::{
    AttributeSnapshot, BackingStore, BridgeError, CodecSlot, Collaborators, ConnectOutcome,
    EntityId, ErrorKind, ErrorReporter, JsonItemCodec, LifecycleHooks, LiveStateSource,
    MemoryLiveState, MemoryStore, ModuleKind, ModulesConfig, PersistenceOrchestrator,
    SaveOutcome, StoreError, SyncConfig, SyncEvent, SyncEventHandler, SyncState, TokioScheduler,
};

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

#[derive(Default)]
struct RecordingReporter {
    reports: Mutex<Vec<(ErrorKind, EntityId)>>,
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, kind: ErrorKind, entity: EntityId, _details: &str) {
        self.reports.lock().push((kind, entity));
    }
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<SyncEvent>>,
}

#[async_trait::async_trait]
impl SyncEventHandler for EventLog {
    async fn handle(&self, event: &SyncEvent) -> Result<(), BridgeError> {
        self.events.lock().push(*event);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "event-log"
    }
}

impl EventLog {
    fn count(&self, wanted: impl Fn(&SyncEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| wanted(e)).count()
    }
}

/// Memory store with switchable outages and an optional write delay.
#[derive(Default)]
struct TestStore {
    inner: MemoryStore,
    offline: AtomicBool,
    reject_writes: AtomicBool,
    write_delay_ms: AtomicU32,
    writes: AtomicU32,
}

#[async_trait::async_trait]
impl BackingStore for TestStore {
    async fn exists(&self, table: &str, key: &str) -> Result<bool, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("store is offline".to_string()));
        }
        self.inner.exists(table, key).await
    }

    async fn write(&self, table: &str, key: &str, payload: &str) -> Result<(), StoreError> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("store is read-only".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(table, key, payload).await
    }

    async fn read(&self, table: &str, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.read(table, key).await
    }

    async fn delete(&self, table: &str, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(table, key).await
    }
}

struct Bridge {
    hooks: Arc<LifecycleHooks>,
    live: Arc<MemoryLiveState>,
    store: Arc<TestStore>,
    reporter: Arc<RecordingReporter>,
    events: Arc<EventLog>,
}

impl Bridge {
    fn new(config: SyncConfig) -> Self {
        let live = Arc::new(MemoryLiveState::new());
        let store = Arc::new(TestStore::default());
        let reporter = Arc::new(RecordingReporter::default());
        let events = Arc::new(EventLog::default());

        let orchestrator = PersistenceOrchestrator::new(
            config,
            Collaborators {
                store: store.clone(),
                live: live.clone(),
                scheduler: Arc::new(TokioScheduler::start()),
                reporter: reporter.clone(),
                codec: CodecSlot::with_codec(Arc::new(JsonItemCodec)),
            },
        )
        .unwrap();
        orchestrator.events().register_handler(events.clone());

        Self {
            hooks: Arc::new(LifecycleHooks::new(Arc::new(orchestrator))),
            live,
            store,
            reporter,
            events,
        }
    }

    fn orchestrator(&self) -> &Arc<PersistenceOrchestrator> {
        self.hooks.orchestrator()
    }

    fn join(&self, currency: f64) -> EntityId {
        let id = EntityId::new_v4();
        self.live.join(
            id,
            AttributeSnapshot {
                currency,
                ..AttributeSnapshot::default()
            },
        );
        id
    }

    fn assert_no_trace(&self, id: EntityId) {
        let orchestrator = self.orchestrator();
        assert!(!orchestrator.states().contains(id));
        assert!(!orchestrator.locks().contains(id));
        assert_eq!(orchestrator.states().pending_async_ops(id), 0);
    }
}

fn small_config() -> SyncConfig {
    SyncConfig {
        retry_step_ms: 5,
        modules: ModulesConfig::only(&[
            ModuleKind::Inventory,
            ModuleKind::Experience,
            ModuleKind::Currency,
        ]),
        ..SyncConfig::default()
    }
}

#[tokio::test]
async fn new_entity_is_registered_saved_and_forgotten() {
    let bridge = Bridge::new(small_config());
    let id = bridge.join(42.0);

    let outcome = bridge.hooks.connect(id).await.unwrap();
    assert!(matches!(
        outcome,
        ConnectOutcome::Registered(SaveOutcome::Confirmed { .. })
    ));
    assert!(bridge.orchestrator().has_record(id).await.unwrap());
    let record = bridge.orchestrator().states().record(id).unwrap();
    assert!(record.last_confirmed_save_at.is_some());
    assert_eq!(
        bridge.events.count(|e| matches!(e, SyncEvent::EntityRegistered { .. })),
        1
    );

    let saved = bridge.hooks.disconnect(id).await.unwrap();
    assert!(matches!(saved, SaveOutcome::Confirmed { .. }));
    assert_eq!(
        bridge.events.count(|e| matches!(e, SyncEvent::SaveConfirmed { .. })),
        2
    );
    bridge.assert_no_trace(id);
    assert!(bridge.reporter.reports.lock().is_empty());
}

#[tokio::test]
async fn reconnect_restores_stored_attributes() {
    let bridge = Bridge::new(small_config());
    let id = bridge.join(10.0);
    bridge.hooks.connect(id).await.unwrap();

    bridge.live.update(id, |snapshot| {
        snapshot.currency = 777.25;
        snapshot.experience.level = 30;
    });
    bridge.hooks.disconnect(id).await.unwrap();
    bridge.live.leave(id);

    bridge.live.join(id, AttributeSnapshot::default());
    let outcome = bridge.hooks.connect(id).await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::Loaded(loaded) if loaded.applied == 3));

    let snapshot = bridge.live.read_snapshot(id).unwrap();
    assert_eq!(snapshot.currency, 777.25);
    assert_eq!(snapshot.experience.level, 30);
    assert_eq!(
        bridge.events.count(|e| matches!(e, SyncEvent::DataLoaded { .. })),
        1
    );
    assert_eq!(bridge.orchestrator().states().get_state(id), SyncState::Idle);
}

#[tokio::test]
async fn failed_disconnect_save_still_cleans_up() {
    let bridge = Bridge::new(small_config());
    let id = bridge.join(5.0);
    bridge.hooks.connect(id).await.unwrap();

    bridge.store.reject_writes.store(true, Ordering::SeqCst);
    let result = bridge.hooks.disconnect(id).await;
    assert!(matches!(result, Err(BridgeError::StoreWriteFailure(_))));

    assert_eq!(
        *bridge.reporter.reports.lock(),
        vec![(ErrorKind::CriticalSaveFailed, id)]
    );
    bridge.assert_no_trace(id);
}

#[tokio::test]
async fn unreachable_store_at_disconnect_raises_alarm() {
    let bridge = Bridge::new(small_config());
    let id = bridge.join(5.0);
    bridge.hooks.connect(id).await.unwrap();

    bridge.store.offline.store(true, Ordering::SeqCst);
    let result = bridge.hooks.disconnect(id).await;
    assert!(matches!(result, Err(BridgeError::StoreWriteFailure(_))));

    assert_eq!(
        *bridge.reporter.reports.lock(),
        vec![(ErrorKind::CriticalSaveFailed, id)]
    );
    bridge.assert_no_trace(id);
}

#[tokio::test]
async fn flush_after_disconnect_does_not_resurrect_entity() {
    let bridge = Bridge::new(small_config());
    let id = bridge.join(8.0);
    bridge.hooks.connect(id).await.unwrap();
    bridge.hooks.disconnect(id).await.unwrap();
    let writes = bridge.store.writes.load(Ordering::SeqCst);

    // The host still lists the entity until its quit handling is over
    tokio::time::sleep(Duration::from_millis(120)).await;
    let report = bridge.hooks.flush().await.unwrap();
    assert_eq!(report.scheduled, 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    bridge.live.leave(id);

    bridge.assert_no_trace(id);
    assert_eq!(bridge.store.writes.load(Ordering::SeqCst), writes);

    // Coming back lifts the lockout
    bridge.live.join(id, AttributeSnapshot::default());
    let outcome = bridge.hooks.connect(id).await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::Loaded(_)));
    assert!(bridge.orchestrator().locks().contains(id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_waits_for_pending_background_save() {
    let bridge = Bridge::new(small_config());
    let id = bridge.join(1.0);
    bridge.orchestrator().register(id).await.unwrap();

    bridge.store.write_delay_ms.store(60, Ordering::SeqCst);
    let report = bridge.hooks.flush().await.unwrap();
    assert_eq!(report.scheduled, 1);

    // Give the background save time to take the lock
    let states = bridge.orchestrator().states().clone();
    for _ in 0..100 {
        if states.has_pending_async(id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(states.has_pending_async(id));

    let hooks = bridge.hooks.clone();
    let connect = tokio::spawn(async move { hooks.connect(id).await });

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!connect.is_finished());
    assert_eq!(states.get_state(id), SyncState::Saving);

    let outcome = connect.await.unwrap().unwrap();
    assert!(matches!(outcome, ConnectOutcome::Loaded(_)));
    assert_eq!(states.pending_async_ops(id), 0);
    // Three module records from the background save
    assert_eq!(bridge.store.writes.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn flush_recovers_stale_locks() {
    let bridge = Bridge::new(SyncConfig {
        stale_lock_ms: 30,
        ..small_config()
    });
    let id = bridge.join(3.0);
    let locks = bridge.orchestrator().locks().clone();

    locks.acquire(id, Duration::from_millis(10)).await.unwrap();
    bridge
        .orchestrator()
        .states()
        .set_state(id, SyncState::Saving);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = bridge.hooks.flush().await.unwrap();
    assert_eq!(report.recovered, vec![id]);
    // The follow-up background save skips the unregistered entity without touching its state
    assert_eq!(bridge.orchestrator().states().get_state(id), SyncState::Idle);
    assert!(locks.acquire(id, Duration::from_secs(1)).await.is_some());
}

#[tokio::test]
async fn shutdown_saves_every_connected_entity() {
    let bridge = Bridge::new(small_config());
    let first = bridge.join(1.0);
    let second = bridge.join(2.0);
    bridge.hooks.connect(first).await.unwrap();
    bridge.hooks.connect(second).await.unwrap();
    assert!(bridge.hooks.start_periodic_flush());

    // Outside the debounce window of the initial saves
    tokio::time::sleep(Duration::from_millis(120)).await;
    bridge.live.update(first, |snapshot| snapshot.currency = 99.0);

    assert_eq!(bridge.hooks.shutdown().await.unwrap(), 2);
    assert!(!bridge.hooks.stop_periodic_flush());

    let stored = bridge
        .store
        .read("player_data_money", &first.to_string())
        .await
        .unwrap();
    assert_eq!(stored.as_deref(), Some("99.0"));
}
