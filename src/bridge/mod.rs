pub mod codec;
pub mod config;
pub mod lifecycle;
pub mod live_state;
pub mod scheduler;
pub mod sync;
pub mod types;

pub use codec::{CodecError, CodecSlot, ItemCodec, JsonItemCodec};
pub use config::{ModulesConfig, SyncConfig};
pub use lifecycle::{AllowAll, ConnectOutcome, FlushReport, LifecycleHooks, NewEntityGate};
pub use live_state::{LiveStateSource, MemoryLiveState};
pub use scheduler::{PeriodicTask, Scheduler, TokioScheduler};
pub use sync::events::{
	ErrorKind, ErrorReporter, EventDispatcher, SyncEvent, SyncEventHandler, TracingReporter,
};
pub use sync::lock_coordinator::{LockCoordinator, LockTicket};
pub use sync::modules::{ModuleKind, ModuleRegistry, SyncModule};
pub use sync::repositories::{BackingStore, FileStore, MemoryStore, StoreError};
pub use sync::state_tracker::{EntitySyncRecord, SyncStateTracker};
pub use sync::{ApplyOutcome, Collaborators, PersistenceOrchestrator, SaveKind, SaveOutcome};
pub use types::*;
