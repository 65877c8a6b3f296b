//! Write replication
//!
//! Every write runs against the local store first. The leader then
//! schedules a broadcast of the exact statement and parameters after the
//! debounce window; every other client re-applies what it receives, in
//! channel order, and notifies refresh listeners.
//!
//! A failed replay is logged and marks the replica diverged. Nothing
//! reconciles a diverged replica automatically.

mod debounce;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{Channel, Subscription};
use crate::config::SyncConfig;
use crate::engine::StoreHandle;
use crate::error::{SyncError, SyncResult};
use crate::leadership::{LeadershipOracle, LeadershipTracker};
use crate::types::{RefreshEvent, ScalarValue, WriteMessage};

pub use debounce::DebounceQueue;

/// State shared between the replicator and its listener task
struct Applier {
    client_id: String,
    store: StoreHandle,
    oracle: Arc<dyn LeadershipOracle>,
    dirty: Arc<AtomicBool>,
    diverged: AtomicBool,
    applied: AtomicU64,
    failed: AtomicU64,
    refresh: broadcast::Sender<RefreshEvent>,
}

impl Applier {
    fn apply(&self, msg: &WriteMessage) -> SyncResult<()> {
        if msg.origin() == self.client_id {
            return Ok(());
        }

        self.oracle.set_accept_external_writes(true);
        let result = self
            .store
            .execute_with_params(msg.sql_text(), msg.bound_params());
        self.oracle.set_accept_external_writes(false);

        match result {
            Ok(changed) => {
                self.dirty.store(true, Ordering::SeqCst);
                self.applied.fetch_add(1, Ordering::SeqCst);
                debug!(origin = msg.origin(), tag = msg.operation_tag(), changed, "replayed write");
                // Ignore errors - just means no listeners
                let _ = self.refresh.send(RefreshEvent {
                    origin: msg.origin().to_string(),
                    operation_tag: msg.operation_tag().to_string(),
                });
                Ok(())
            }
            Err(e) => {
                let err = SyncError::ReplicationApplyFailure {
                    origin: msg.origin().to_string(),
                    tag: msg.operation_tag().to_string(),
                    reason: e.to_string(),
                };
                self.mark_diverged(&err);
                Err(err)
            }
        }
    }

    fn mark_diverged(&self, err: &SyncError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        if !self.diverged.swap(true, Ordering::SeqCst) {
            warn!(store = self.store.name(), error = %err, "replica diverged from leader");
        } else {
            warn!(store = self.store.name(), error = %err, "replay failed");
        }
    }

    async fn listen(self: Arc<Self>, mut sub: Subscription) {
        while let Some(raw) = sub.recv().await {
            match WriteMessage::from_json(&raw) {
                // apply() already logged and counted any failure
                Ok(msg) => {
                    let _ = self.apply(&msg);
                }
                Err(e) => self.mark_diverged(&SyncError::Json(e)),
            }
        }
        debug!(topic = sub.topic(), "write topic closed");
    }
}

/// Routes local writes to the store and the replication channel
pub struct WriteReplicator {
    applier: Arc<Applier>,
    tracker: Arc<LeadershipTracker>,
    queue: DebounceQueue,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteReplicator {
    /// Subscribe to the store's write topic and start the background tasks
    ///
    /// `dirty` is raised after every successful local write or replay so
    /// the durable layer knows a new snapshot is due.
    pub fn start(
        store: StoreHandle,
        tracker: Arc<LeadershipTracker>,
        oracle: Arc<dyn LeadershipOracle>,
        channel: Arc<dyn Channel>,
        config: &SyncConfig,
        dirty: Arc<AtomicBool>,
    ) -> SyncResult<Self> {
        let topic = config.write_topic(store.name());
        let sub = channel.subscribe(&topic)?;
        let (refresh, _) = broadcast::channel(config.channel_capacity.max(1));

        let applier = Arc::new(Applier {
            client_id: oracle.client_id().to_string(),
            store,
            oracle,
            dirty,
            diverged: AtomicBool::new(false),
            applied: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            refresh,
        });

        let listener = tokio::spawn(Arc::clone(&applier).listen(sub));
        let (queue, drain) = DebounceQueue::spawn(channel, topic, config.debounce);

        Ok(Self {
            applier,
            tracker,
            queue,
            tasks: Mutex::new(vec![listener, drain]),
        })
    }

    /// Execute a write locally, then broadcast it if this client leads
    ///
    /// A local failure is returned to the caller and nothing is sent.
    pub fn execute_local_write(
        &self,
        sql: &str,
        params: Vec<ScalarValue>,
        operation_tag: &str,
    ) -> SyncResult<usize> {
        let changed = self.applier.store.execute_with_params(sql, &params)?;
        self.applier.dirty.store(true, Ordering::SeqCst);

        if self.tracker.current_role().is_leader {
            let msg = WriteMessage::new(&self.applier.client_id, sql, params, operation_tag);
            self.queue.schedule(msg)?;
        } else {
            debug!(tag = operation_tag, "follower write kept local");
        }
        Ok(changed)
    }

    /// Re-apply a write received from another client
    pub fn on_message(&self, msg: &WriteMessage) -> SyncResult<()> {
        self.applier.apply(msg)
    }

    /// Receiver fired after each applied replay
    pub fn subscribe_refresh(&self) -> broadcast::Receiver<RefreshEvent> {
        self.applier.refresh.subscribe()
    }

    pub fn is_diverged(&self) -> bool {
        self.applier.diverged.load(Ordering::SeqCst)
    }

    pub fn replays_applied(&self) -> u64 {
        self.applier.applied.load(Ordering::SeqCst)
    }

    pub fn replays_failed(&self) -> u64 {
        self.applier.failed.load(Ordering::SeqCst)
    }

    /// Stop listening and drop every broadcast still waiting on its window
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for WriteReplicator {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalBus;
    use crate::engine::SqliteEngine;
    use crate::leadership::{LeaseRegistry, LocalLeaseOracle};
    use std::time::Duration;

    const SCHEMA: &str = "CREATE TABLE notes(id TEXT PRIMARY KEY, title TEXT);";

    struct Node {
        oracle: Arc<LocalLeaseOracle>,
        store: StoreHandle,
        dirty: Arc<AtomicBool>,
        replicator: WriteReplicator,
    }

    fn node(registry: &LeaseRegistry, bus: &LocalBus, id: &str) -> Node {
        let mut engine = SqliteEngine::open_in_memory().unwrap();
        crate::engine::StoreEngine::execute(&mut engine, SCHEMA).unwrap();
        let store = StoreHandle::new("notes", Box::new(engine));

        let oracle = Arc::new(registry.join(id));
        let tracker = LeadershipTracker::start(oracle.clone());
        let dirty = Arc::new(AtomicBool::new(false));
        let config = SyncConfig::default().with_debounce(Duration::from_millis(50));
        let replicator = WriteReplicator::start(
            store.clone(),
            tracker,
            oracle.clone(),
            Arc::new(bus.endpoint()),
            &config,
            dirty.clone(),
        )
        .unwrap();

        Node {
            oracle,
            store,
            dirty,
            replicator,
        }
    }

    fn title_of(store: &StoreHandle, id: &str) -> Option<ScalarValue> {
        store
            .query("SELECT title FROM notes WHERE id = ?1", &[id.into()])
            .unwrap()
            .into_iter()
            .next()
            .map(|mut row| row.remove(0))
    }

    #[tokio::test]
    async fn test_leader_write_reaches_follower() {
        let registry = LeaseRegistry::default();
        let bus = LocalBus::default();
        let leader = node(&registry, &bus, "a");
        let follower = node(&registry, &bus, "b");
        let mut refresh = follower.replicator.subscribe_refresh();

        leader
            .replicator
            .execute_local_write("INSERT INTO notes(id,title) VALUES ('n1','Hello')", vec![], "insert")
            .unwrap();
        assert_eq!(title_of(&leader.store, "n1"), Some("Hello".into()));
        assert!(leader.dirty.load(Ordering::SeqCst));

        let event = tokio::time::timeout(Duration::from_secs(2), refresh.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.origin, "a");
        assert_eq!(event.operation_tag, "insert");
        assert_eq!(title_of(&follower.store, "n1"), Some("Hello".into()));
        assert!(follower.dirty.load(Ordering::SeqCst));
        assert_eq!(follower.replicator.replays_applied(), 1);
        assert!(!follower.oracle.accepts_external_writes());

        // The leader skipped its own message
        assert_eq!(leader.replicator.replays_applied(), 0);
    }

    #[tokio::test]
    async fn test_follower_write_stays_local() {
        let registry = LeaseRegistry::default();
        let bus = LocalBus::default();
        let _leader = node(&registry, &bus, "a");
        let follower = node(&registry, &bus, "b");

        follower
            .replicator
            .execute_local_write(
                "INSERT INTO notes(id, title) VALUES (?1, ?2)",
                vec!["n2".into(), "Local".into()],
                "insert",
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(title_of(&follower.store, "n2"), Some("Local".into()));
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_local_write_is_not_broadcast() {
        let registry = LeaseRegistry::default();
        let bus = LocalBus::default();
        let leader = node(&registry, &bus, "a");

        let err = leader
            .replicator
            .execute_local_write("INSERT INTO missing VALUES (1)", vec![], "insert")
            .unwrap_err();
        assert!(matches!(err, SyncError::Engine(_)));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(bus.published_count(), 0);
        assert!(!leader.dirty.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_replay_failure_marks_diverged_and_continues() {
        let registry = LeaseRegistry::default();
        let bus = LocalBus::default();
        let _leader = node(&registry, &bus, "a");
        let follower = node(&registry, &bus, "b");

        let bad = WriteMessage::new("a", "INSERT INTO tags(name) VALUES ('x')", vec![], "insert");
        let err = follower.replicator.on_message(&bad).unwrap_err();
        assert!(matches!(err, SyncError::ReplicationApplyFailure { .. }));
        assert!(follower.replicator.is_diverged());
        assert!(!follower.oracle.accepts_external_writes());

        let good = WriteMessage::new(
            "a",
            "INSERT INTO notes(id, title) VALUES (?1, ?2)",
            vec!["n3".into(), ScalarValue::Null],
            "insert",
        );
        follower.replicator.on_message(&good).unwrap();
        assert_eq!(title_of(&follower.store, "n3"), Some(ScalarValue::Null));
        assert_eq!(follower.replicator.replays_failed(), 1);
        assert_eq!(follower.replicator.replays_applied(), 1);
    }

    #[tokio::test]
    async fn test_stop_drops_pending_broadcasts() {
        let registry = LeaseRegistry::default();
        let bus = LocalBus::default();
        let leader = node(&registry, &bus, "a");

        leader
            .replicator
            .execute_local_write("INSERT INTO notes(id,title) VALUES ('n4','Late')", vec![], "insert")
            .unwrap();
        leader.replicator.stop();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(bus.published_count(), 0);
        assert_eq!(title_of(&leader.store, "n4"), Some("Late".into()));
    }
}
