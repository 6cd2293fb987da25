use player_state_bridge::{
	AttributeSnapshot, BackingStore, BridgeError, CodecSlot, Collaborators, ConnectOutcome,
	EntityId, FileStore, GameMode, ItemStack, JsonItemCodec, LifecycleHooks, LiveStateSource,
	MemoryLiveState, MemoryStore, PersistenceOrchestrator, SyncConfig, TokioScheduler,
	TracingReporter,
};

use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const ENTITIES: usize = 3;

#[tokio::main(flavor = "current_thread")]
async fn main() {
	// RUST_LOG overrides the default of info-level logs for this crate
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("player_state_bridge=info")),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = run().await {
		error!("Bridge demo failed: {}", e);
		std::process::exit(1);
	}
}

fn load_config() -> Result<SyncConfig, BridgeError> {
	match std::env::var("BRIDGE_CONFIG") {
		Ok(path) => {
			info!("Loading configuration from {}", path);
			SyncConfig::from_json_file(path)
		}
		Err(_) => Ok(SyncConfig {
			flush_interval_ms: 1_000,
			..SyncConfig::default()
		}),
	}
}

fn open_store() -> Arc<dyn BackingStore> {
	match std::env::var("BRIDGE_DATA_DIR") {
		Ok(dir) => {
			info!("Storing records under {}", dir);
			Arc::new(FileStore::new(PathBuf::from(dir)))
		}
		Err(_) => Arc::new(MemoryStore::new()),
	}
}

fn random_snapshot() -> AttributeSnapshot {
	let mut rng = rand::rng();
	AttributeSnapshot {
		inventory: vec![
			Some(ItemStack::new("cobblestone", rng.random_range(1..=64))),
			None,
			Some(ItemStack::new("torch", rng.random_range(1..=16))),
		],
		currency: f64::from(rng.random_range(0..10_000u32)) / 100.0,
		mode: GameMode::Survival,
		hotbar_slot: rng.random_range(0..9),
		..AttributeSnapshot::default()
	}
}

async fn run() -> Result<(), BridgeError> {
	let config = load_config()?;
	let live = Arc::new(MemoryLiveState::new());

	let orchestrator = Arc::new(PersistenceOrchestrator::new(
		config,
		Collaborators {
			store: open_store(),
			live: live.clone(),
			scheduler: Arc::new(TokioScheduler::start()),
			reporter: Arc::new(TracingReporter),
			codec: CodecSlot::with_codec(Arc::new(JsonItemCodec)),
		},
	)?);
	let hooks = Arc::new(LifecycleHooks::new(orchestrator.clone()));
	hooks.start_periodic_flush();

	let entities: Vec<EntityId> = (0..ENTITIES).map(|_| EntityId::new_v4()).collect();
	for id in &entities {
		live.join(*id, random_snapshot());
		match hooks.connect(*id).await? {
			ConnectOutcome::Registered(outcome) => info!("{} registered: {:?}", id, outcome),
			other => info!("{} connected: {:?}", id, other),
		}
	}

	for round in 1..=3 {
		for id in &entities {
			let earned = f64::from(rand::rng().random_range(1..500u32));
			live.update(*id, |snapshot| {
				snapshot.currency += earned;
				snapshot.experience.level += 1;
			});
		}
		let report = hooks.flush().await?;
		info!("Flush round {}: {} saves queued", round, report.scheduled);
		tokio::time::sleep(Duration::from_millis(250)).await;
	}

	// Reconnect the first entity with empty live state; its stored data comes back
	let first = entities[0];
	let before = live.read_snapshot(first);
	hooks.disconnect(first).await?;
	live.leave(first);

	live.join(first, AttributeSnapshot::default());
	let outcome = hooks.connect(first).await?;
	let after = live.read_snapshot(first);
	info!(
		"{} reconnected ({:?}); currency {:?} -> {:?}",
		first,
		outcome,
		before.map(|s| s.currency),
		after.map(|s| s.currency)
	);

	let flushed = hooks.shutdown().await?;
	for id in &entities {
		hooks.disconnect(*id).await?;
		live.leave(*id);
	}
	info!(
		"Shutdown saved {} entities; {} still tracked",
		flushed,
		orchestrator.states().tracked_entities()
	);
	Ok(())
}
