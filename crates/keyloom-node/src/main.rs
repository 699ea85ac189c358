//! Keyloom node binary.
//!
//! # Usage
//!
//! ```bash
//! # Two in-process nodes: handshake, full ratchet, device discovery
//! keyloom-node demo
//!
//! # Same, persisted to redb files under ./data
//! keyloom-node demo --data-dir ./data
//!
//! # One maintenance pass over an existing database
//! keyloom-node maintain --db ./data/alice.redb
//! ```

use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use keyloom_core::{ChannelId, Engine, EngineConfig, Notification, Storage};
use keyloom_node::{
    MemoryNetwork, Node, NodeConfig, SystemEnv,
    storage::{MemoryStorage, RedbStorage},
};
use tokio::sync::broadcast;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// How long the demo waits for any single protocol to finish.
const DEMO_TIMEOUT: Duration = Duration::from_secs(10);

/// Keyloom messaging engine node
#[derive(Parser, Debug)]
#[command(name = "keyloom-node")]
#[command(about = "Keyloom ratcheting channel engine")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Minimum number of receive keys kept ready per channel
    #[arg(long, default_value_t = 10, global = true)]
    threshold: u64,

    /// Seconds between maintenance passes
    #[arg(long, default_value_t = 600, global = true)]
    maintenance_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run two nodes through channel creation, a full ratchet and discovery
    Demo {
        /// Directory for redb files (in-memory if omitted)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Delete expired keys and empty provisions
    Maintain {
        /// Redb database file
        #[arg(long)]
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut config = NodeConfig {
        engine: EngineConfig { reprovisioning_threshold: args.threshold, ..Default::default() },
        maintenance_interval: Duration::from_secs(args.maintenance_secs),
        ..Default::default()
    };

    match args.command {
        Command::Demo { data_dir: Some(dir) } => {
            std::fs::create_dir_all(&dir)?;
            let alice = RedbStorage::open(dir.join("alice.redb"))?;
            let bob = RedbStorage::open(dir.join("bob.redb"))?;
            tracing::info!("Persisting to {}", dir.display());
            demo(alice, bob, &config).await
        },
        Command::Demo { data_dir: None } => {
            demo(MemoryStorage::new(), MemoryStorage::new(), &config).await
        },
        Command::Maintain { db } => {
            config.db_path = Some(db);
            maintain(&config)
        },
    }
}

fn maintain(config: &NodeConfig) -> Result<(), Box<dyn Error>> {
    let Some(path) = &config.db_path else {
        return Err("maintenance needs a database path".into());
    };

    let engine = Engine::new(RedbStorage::open(path)?, SystemEnv::new(), config.engine)?;
    let report = engine.run_maintenance()?;

    tracing::info!(
        expired_keys = report.expired_keys,
        deleted_provisions = report.deleted_provisions,
        "Maintenance complete"
    );
    Ok(())
}

async fn demo<S: Storage + 'static>(
    alice_storage: S,
    bob_storage: S,
    config: &NodeConfig,
) -> Result<(), Box<dyn Error>> {
    let network = MemoryNetwork::new();
    let alice = Arc::new(Node::new(
        Engine::new(alice_storage, SystemEnv::new(), config.engine)?,
        network.clone(),
    ));
    let bob = Arc::new(Node::new(
        Engine::new(bob_storage, SystemEnv::new(), config.engine)?,
        network.clone(),
    ));

    let alice_id = alice.create_owned_identity()?;
    let bob_id = bob.create_owned_identity()?;
    tracing::info!("Alice is {}, Bob is {}", alice_id.identity, bob_id.identity);

    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();
    let flows = vec![
        alice.spawn_mailbox(network.register(alice_id.identity, alice_id.current_device)),
        bob.spawn_mailbox(network.register(bob_id.identity, bob_id.current_device)),
        alice.spawn_maintenance(config.maintenance_interval),
        bob.spawn_maintenance(config.maintenance_interval),
    ];

    let channel = ChannelId {
        owned_identity: alice_id.identity,
        remote_identity: bob_id.identity,
        remote_device: bob_id.current_device,
    };

    alice
        .start_channel_creation(alice_id.identity, bob_id.identity, bob_id.current_device)
        .await?;
    wait_for(&mut alice_events, |n| matches!(n, Notification::ChannelConfirmed { .. })).await?;
    wait_for(&mut bob_events, |n| matches!(n, Notification::ChannelConfirmed { .. })).await?;
    tracing::info!("Channel confirmed on both ends");

    alice.request_full_ratchet(&channel).await?;
    for events in [&mut alice_events, &mut bob_events] {
        let done =
            wait_for(events, |n| matches!(n, Notification::FullRatchetCompleted { .. })).await?;
        tracing::info!("{done:?}");
    }

    alice.start_device_discovery(alice_id.identity, bob_id.identity).await?;
    let discovered =
        wait_for(&mut alice_events, |n| matches!(n, Notification::DevicesDiscovered { .. }))
            .await?;
    tracing::info!("{discovered:?}");

    for flow in flows {
        let name = flow.name();
        let handled = flow.stop().await?;
        tracing::info!(flow = name, handled, "Flow stopped");
    }
    tracing::info!("{} envelopes exchanged", network.delivered());
    Ok(())
}

async fn wait_for(
    events: &mut broadcast::Receiver<Notification>,
    wanted: impl Fn(&Notification) -> bool,
) -> Result<Notification, Box<dyn Error>> {
    let next = async {
        loop {
            let notification = events.recv().await?;
            if wanted(&notification) {
                return Ok::<_, broadcast::error::RecvError>(notification);
            }
        }
    };
    Ok(tokio::time::timeout(DEMO_TIMEOUT, next).await??)
}
