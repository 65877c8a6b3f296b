//! Replica Sync
//!
//! Keeps several clients, each holding its own embedded SQLite replica of
//! the same logical database, consistent while only one of them (the
//! leader) persists durably at a time.
//!
//! # Features
//!
//! - **Race-safe creation**: clients negotiate before creating a store
//! - **Idempotent bootstrap**: trigger-aware migration splitting plus a schema probe
//! - **Write replication**: leader writes are broadcast after a debounce and replayed in order
//! - **Durable snapshots**: checkpoint + export into a single slot, restore on cold start
//! - **Pluggable leadership**: the election is an injected oracle
//!
//! # Modules
//!
//! - `types`: Scalar values, channel messages, lease and lifecycle state
//! - `engine`: Store engine abstraction and the rusqlite implementation
//! - `channel`: Pub/sub channel abstraction and the in-process bus
//! - `bootstrap`: Statement splitter and schema bootstrap
//! - `init`: Store creation arbitration
//! - `leadership`: Oracle trait, local lease registry, role tracker
//! - `replication`: Local write interception and replay
//! - `durable`: Slot stores and snapshot persistence
//! - `client`: The `Client` facade running the full lifecycle
//! - `utils`: Atomic file writes and the millisecond clock
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use replica_sync::{Client, ClientDeps, FileSlotStore, LeaseRegistry, LocalBus, SqliteFactory, SyncConfig};
//!
//! # async fn run() -> replica_sync::SyncResult<()> {
//! let config = SyncConfig::new("data");
//! let bus = LocalBus::default();
//! let registry = LeaseRegistry::default();
//! let deps = ClientDeps::new(
//!     Arc::new(SqliteFactory::new(config.stores_dir())),
//!     Arc::new(bus.endpoint()),
//!     Arc::new(registry.join("tab-1")),
//!     Arc::new(FileSlotStore::open(config.slots_dir())?),
//! );
//!
//! let client = Client::open_store("notes", config, deps).await?;
//! client.write("INSERT INTO notes(id, title) VALUES (?1, ?2)", vec!["n1".into(), "Hello".into()])?;
//! client.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod channel;
pub mod client;
pub mod config;
pub mod durable;
pub mod engine;
pub mod error;
pub mod init;
pub mod leadership;
pub mod replication;
pub mod types;
pub mod utils;

// Re-export commonly used items at crate root
pub use bootstrap::{apply_migrations, split_statements, SchemaBootstrap};
pub use channel::{Channel, LocalBus};
pub use client::{Client, ClientDeps};
pub use config::SyncConfig;
pub use durable::{DurableSync, FileSlotStore, MemorySlotStore, SlotStore};
pub use engine::{EngineFactory, SqliteFactory, StoreEngine, StoreHandle};
pub use error::{SyncError, SyncResult};
pub use init::{InitCoordinator, InitDecision};
pub use leadership::{LeadershipOracle, LeadershipTracker, LeaseRegistry, LocalLeaseOracle};
pub use replication::WriteReplicator;
pub use types::{
    ClientStatus, LeaseState, PersistOutcome, RefreshEvent, ScalarValue, SnapshotRecord,
    StoreState, WriteMessage,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
