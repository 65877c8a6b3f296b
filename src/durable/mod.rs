//! Durable snapshotting
//!
//! The engine's own persistence path is not trusted across clients, so
//! the leader periodically checkpoints, exports the whole store and puts
//! the bytes into a single slot named after the database. Cold starts
//! look that slot up before deciding between restore and bootstrap.
//!
//! Persist failures never reach the write path. They keep the unsynced
//! flag raised and the next tick retries.

mod slot_store;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::StoreHandle;
use crate::error::{SyncError, SyncResult};
use crate::leadership::LeadershipTracker;
use crate::types::{LeaseState, PersistOutcome, SnapshotRecord};
use crate::utils::elapsed_millis;

pub use slot_store::{FileSlotStore, MemorySlotStore, SlotStore, SLOT_LAYOUT_VERSION};

const NEVER: i64 = i64::MIN;

/// Snapshot persistence for one logical database
pub struct DurableSync {
    slot: String,
    slots: Arc<dyn SlotStore>,
    unsynced: Arc<AtomicBool>,
    last_persist_at: AtomicI64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DurableSync {
    /// Create a new DurableSync writing to the slot named `slot`
    pub fn new(slot: &str, slots: Arc<dyn SlotStore>) -> Self {
        Self {
            slot: slot.to_string(),
            slots,
            unsynced: Arc::new(AtomicBool::new(false)),
            last_persist_at: AtomicI64::new(NEVER),
            task: Mutex::new(None),
        }
    }

    /// Shared flag other components raise after changing the store
    pub fn unsynced_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.unsynced)
    }

    pub fn mark_unsynced(&self) {
        self.unsynced.store(true, Ordering::SeqCst);
    }

    /// Local changes exist that no snapshot has captured yet
    pub fn is_unsynced(&self) -> bool {
        self.unsynced.load(Ordering::SeqCst)
    }

    pub fn last_persist_at(&self) -> Option<i64> {
        match self.last_persist_at.load(Ordering::SeqCst) {
            NEVER => None,
            at => Some(at),
        }
    }

    /// Latest non-empty snapshot for this database, if any
    pub fn restore_if_snapshot_exists(&self) -> SyncResult<Option<SnapshotRecord>> {
        let record = self.slots.get(&self.slot)?.filter(|r| !r.is_empty());
        match &record {
            Some(r) => debug!(slot = %self.slot, bytes = r.bytes.len(), written_at = r.written_at_millis, "snapshot found"),
            None => debug!(slot = %self.slot, "no snapshot"),
        }
        Ok(record)
    }

    /// Checkpoint, export and store a snapshot when `role` is leader
    ///
    /// The unsynced flag is cleared before exporting so a write landing
    /// during the export raises it again. On failure the flag is restored.
    pub fn persist_if_leader(&self, store: &StoreHandle, role: &LeaseState) -> SyncResult<PersistOutcome> {
        if !role.is_leader {
            return Ok(PersistOutcome::NotLeader);
        }

        let started = Instant::now();
        self.unsynced.store(false, Ordering::SeqCst);
        let result = store
            .with_engine(|engine| {
                engine.checkpoint()?;
                engine.export_snapshot()
            })
            .and_then(|bytes| {
                let record = SnapshotRecord::new(bytes);
                self.slots.put(&self.slot, &record)?;
                Ok(record)
            });

        match result {
            Ok(record) => {
                self.last_persist_at
                    .store(record.written_at_millis, Ordering::SeqCst);
                info!(
                    slot = %self.slot,
                    bytes = record.bytes.len(),
                    elapsed_ms = elapsed_millis(started),
                    "snapshot persisted"
                );
                Ok(PersistOutcome::Written(record.bytes.len()))
            }
            Err(e) => {
                self.unsynced.store(true, Ordering::SeqCst);
                warn!(slot = %self.slot, error = %e, "snapshot persist failed, will retry");
                Err(SyncError::DurablePersistFailure(e.to_string()))
            }
        }
    }

    /// Persist every `interval` while this client leads and has changes
    pub fn spawn_persist_loop(
        self: &Arc<Self>,
        store: StoreHandle,
        tracker: Arc<LeadershipTracker>,
        interval: Duration,
    ) {
        let task = tokio::spawn(Self::run(Arc::downgrade(self), store, tracker, interval));
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }

    async fn run(
        durable: Weak<Self>,
        store: StoreHandle,
        tracker: Arc<LeadershipTracker>,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(durable) = durable.upgrade() else {
                break;
            };
            if !durable.is_unsynced() {
                continue;
            }
            // Errors are logged inside and retried on the next tick
            let _ = durable.persist_if_leader(&store, &tracker.current_role());
        }
    }

    /// Stop the periodic loop
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for DurableSync {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
