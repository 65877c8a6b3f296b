//! Cold start of a client's store
//!
//! ```text
//! Cold -> Restoring -> Reopening -> Ready      snapshot found
//! Cold -> Bootstrapping -> Ready               no snapshot, or store already on disk
//! ```
//!
//! An unusable snapshot drops from `Restoring`/`Reopening` to
//! `Bootstrapping` on a fresh store.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::bootstrap::SchemaBootstrap;
use crate::config::SyncConfig;
use crate::durable::DurableSync;
use crate::engine::{EngineFactory, StoreEngine};
use crate::error::{SyncError, SyncResult};
use crate::types::{SnapshotRecord, StoreState};

const REOPEN_POLL: Duration = Duration::from_millis(25);

/// Validated state machine for one store
#[derive(Debug, Clone)]
pub struct Lifecycle {
    store: String,
    path: Vec<StoreState>,
}

impl Lifecycle {
    pub fn new(store: &str) -> Self {
        Self {
            store: store.to_string(),
            path: vec![StoreState::Cold],
        }
    }

    pub fn state(&self) -> StoreState {
        self.path.last().copied().unwrap_or(StoreState::Cold)
    }

    /// Every state visited so far, starting with `Cold`
    pub fn path(&self) -> &[StoreState] {
        &self.path
    }

    pub fn advance(&mut self, next: StoreState) -> SyncResult<()> {
        let from = self.state();
        if !from.can_transition_to(next) {
            return Err(SyncError::InvalidTransition { from, to: next });
        }
        info!(store = %self.store, ?from, to = ?next, "store state");
        self.path.push(next);
        Ok(())
    }
}

/// Bring `name` from `Cold` to an open engine, ready to be marked `Ready`
pub(crate) async fn open_engine(
    name: &str,
    factory: &dyn EngineFactory,
    durable: &DurableSync,
    config: &SyncConfig,
    lifecycle: &mut Lifecycle,
) -> SyncResult<Box<dyn StoreEngine>> {
    let bootstrap = SchemaBootstrap::from_config(config);

    if factory.exists(name) {
        // Probe short-circuits unless a previous bootstrap was interrupted
        lifecycle.advance(StoreState::Bootstrapping)?;
        let mut engine = factory.open(name)?;
        bootstrap.apply(engine.as_mut())?;
        return Ok(engine);
    }

    let snapshot = durable.restore_if_snapshot_exists().unwrap_or_else(|e| {
        error!(store = name, error = %e, "snapshot slot unreadable, data may be lost");
        None
    });

    if let Some(record) = snapshot {
        lifecycle.advance(StoreState::Restoring)?;
        match restore_snapshot(name, &record, factory, config, lifecycle).await {
            Ok(mut engine) => {
                bootstrap.apply(engine.as_mut())?;
                return Ok(engine);
            }
            Err(e) => {
                error!(
                    store = name,
                    error = %e,
                    snapshot_at = record.written_at_millis,
                    "snapshot unusable, starting from an empty schema; its data is lost"
                );
                factory.remove(name)?;
            }
        }
    }

    lifecycle.advance(StoreState::Bootstrapping)?;
    let mut engine = factory.create(name)?;
    bootstrap.apply(engine.as_mut())?;
    Ok(engine)
}

/// Import into a throwaway store, then move it into place and reopen
///
/// The importing handle is closed before the store is promoted; the
/// handle returned is always a fresh open of `name`.
async fn restore_snapshot(
    name: &str,
    record: &SnapshotRecord,
    factory: &dyn EngineFactory,
    config: &SyncConfig,
    lifecycle: &mut Lifecycle,
) -> SyncResult<Box<dyn StoreEngine>> {
    let scratch = format!("{}.restore-{}", name, Uuid::new_v4().simple());
    let imported = factory.create(&scratch).and_then(|mut engine| {
        engine.import_snapshot(&record.bytes)?;
        engine.checkpoint()
    });
    if let Err(e) = imported {
        let _ = factory.remove(&scratch);
        return Err(e);
    }
    debug!(store = name, scratch = %scratch, bytes = record.bytes.len(), "snapshot imported");

    lifecycle.advance(StoreState::Reopening)?;
    if let Err(e) = factory.promote(&scratch, name) {
        let _ = factory.remove(&scratch);
        return Err(e);
    }
    reopen_when_ready(name, factory, config.import_settle).await
}

/// Poll until `name` opens and answers a query, bounded by `settle`
async fn reopen_when_ready(
    name: &str,
    factory: &dyn EngineFactory,
    settle: Duration,
) -> SyncResult<Box<dyn StoreEngine>> {
    let deadline = Instant::now() + settle;
    loop {
        let attempt = factory.open(name).and_then(|engine| {
            engine.query("SELECT count(*) FROM sqlite_master", &[])?;
            Ok(engine)
        });
        match attempt {
            Ok(engine) => return Ok(engine),
            Err(e) if Instant::now() >= deadline => {
                return Err(SyncError::SnapshotCorrupt(format!(
                    "store not usable after import: {}",
                    e
                )))
            }
            Err(e) => {
                debug!(store = name, error = %e, "store not ready after import, polling");
                sleep(REOPEN_POLL).await;
            }
        }
    }
}
