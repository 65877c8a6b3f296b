//! Client facade
//!
//! [`Client::open_store`] runs the whole cold start: init negotiation,
//! restore or bootstrap, first leadership decision, then replication and
//! periodic persistence. Everything after that goes through the client.

mod lifecycle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::channel::Channel;
use crate::config::SyncConfig;
use crate::durable::{DurableSync, SlotStore};
use crate::engine::{EngineFactory, StoreHandle};
use crate::error::{SyncError, SyncResult};
use crate::init::{InitCoordinator, InitDecision};
use crate::leadership::{LeadershipOracle, LeadershipTracker, RoleCallback};
use crate::replication::WriteReplicator;
use crate::types::{
    operation_tag_for, ClientStatus, LeaseState, PersistOutcome, RefreshEvent, Rows, ScalarValue,
    StoreState,
};

pub use lifecycle::Lifecycle;

/// External collaborators a client is built from
#[derive(Clone)]
pub struct ClientDeps {
    pub factory: Arc<dyn EngineFactory>,
    pub channel: Arc<dyn Channel>,
    pub oracle: Arc<dyn LeadershipOracle>,
    pub slots: Arc<dyn SlotStore>,
}

impl ClientDeps {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        channel: Arc<dyn Channel>,
        oracle: Arc<dyn LeadershipOracle>,
        slots: Arc<dyn SlotStore>,
    ) -> Self {
        Self {
            factory,
            channel,
            oracle,
            slots,
        }
    }
}

/// One client attached to a logical database
pub struct Client {
    client_id: String,
    store: StoreHandle,
    lifecycle: Lifecycle,
    oracle: Arc<dyn LeadershipOracle>,
    channel: Arc<dyn Channel>,
    tracker: Arc<LeadershipTracker>,
    replicator: WriteReplicator,
    durable: Arc<DurableSync>,
    closed: AtomicBool,
}

impl Client {
    /// Open `name` and take it from `Cold` to `Ready`
    ///
    /// Init and bootstrap failures are returned; so is a leadership oracle
    /// that never decides within `config.leadership_wait`.
    pub async fn open_store(name: &str, config: SyncConfig, deps: ClientDeps) -> SyncResult<Self> {
        let config = Arc::new(config);
        let client_id = deps.oracle.client_id().to_string();
        info!(store = name, client = %client_id, "opening store");

        let coordinator = InitCoordinator::new(&client_id, Arc::clone(&deps.channel), Arc::clone(&config));
        let factory = Arc::clone(&deps.factory);
        let decision = coordinator
            .acquire_init_right(name, || factory.exists(name))
            .await?;

        let durable = Arc::new(DurableSync::new(name, Arc::clone(&deps.slots)));
        let mut lifecycle = Lifecycle::new(name);
        let engine =
            lifecycle::open_engine(name, deps.factory.as_ref(), &durable, &config, &mut lifecycle)
                .await?;
        if let InitDecision::Create(grant) = decision {
            grant.complete()?;
        }
        lifecycle.advance(StoreState::Ready)?;
        let store = StoreHandle::new(name, engine);

        let tracker = LeadershipTracker::start(Arc::clone(&deps.oracle));
        let replicator = WriteReplicator::start(
            store.clone(),
            Arc::clone(&tracker),
            Arc::clone(&deps.oracle),
            Arc::clone(&deps.channel),
            &config,
            durable.unsynced_flag(),
        )?;

        let role = match tracker.wait_for_determination(config.leadership_wait).await {
            Ok(role) => role,
            Err(e) => {
                tracker.stop();
                replicator.stop();
                return Err(e);
            }
        };
        info!(store = name, client = %client_id, is_leader = role.is_leader, leader = ?role.leader_id, "store ready");

        // A new leader owes the durable slot a snapshot of its replica
        let unsynced = durable.unsynced_flag();
        tracker.on_role_change(Box::new(move |state| {
            if state.is_leader {
                unsynced.store(true, Ordering::SeqCst);
            }
        }));
        if role.is_leader {
            durable.mark_unsynced();
        }
        durable.spawn_persist_loop(store.clone(), Arc::clone(&tracker), config.persist_interval);

        Ok(Self {
            client_id,
            store,
            lifecycle,
            oracle: deps.oracle,
            channel: deps.channel,
            tracker,
            replicator,
            durable,
            closed: AtomicBool::new(false),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// States the store went through while opening
    pub fn lifecycle(&self) -> &[StoreState] {
        self.lifecycle.path()
    }

    /// Execute a write, tagged with its leading keyword
    pub fn write(&self, sql: &str, params: Vec<ScalarValue>) -> SyncResult<usize> {
        self.write_tagged(sql, params, &operation_tag_for(sql))
    }

    pub fn write_tagged(&self, sql: &str, params: Vec<ScalarValue>, tag: &str) -> SyncResult<usize> {
        self.ensure_open()?;
        self.replicator.execute_local_write(sql, params, tag)
    }

    /// Read from the local replica
    pub fn query(&self, sql: &str, params: &[ScalarValue]) -> SyncResult<Rows> {
        self.ensure_open()?;
        self.store.query(sql, params)
    }

    pub fn current_role(&self) -> LeaseState {
        self.tracker.current_role()
    }

    pub fn on_role_change(&self, callback: RoleCallback) {
        self.tracker.on_role_change(callback);
    }

    /// Receiver fired after every replicated write applied here
    pub fn subscribe_refresh(&self) -> broadcast::Receiver<RefreshEvent> {
        self.replicator.subscribe_refresh()
    }

    /// Persist a snapshot now; a no-op on followers
    pub fn force_persist(&self) -> SyncResult<PersistOutcome> {
        self.ensure_open()?;
        self.durable
            .persist_if_leader(&self.store, &self.tracker.current_role())
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            client_id: self.client_id.clone(),
            store: self.store.name().to_string(),
            state: self.lifecycle.state(),
            lease: self.tracker.current_role(),
            diverged: self.replicator.is_diverged(),
            unsynced: self.durable.is_unsynced(),
            replays_applied: self.replicator.replays_applied(),
            replays_failed: self.replicator.replays_failed(),
            last_persist_at_millis: self.durable.last_persist_at(),
        }
    }

    /// Tear the client down
    ///
    /// Timers and pending broadcasts are dropped, role callbacks are
    /// removed, a leader with unsynced changes writes a final snapshot,
    /// then the client leaves the election and closes its channel. The
    /// final persist error, if any, is returned after teardown completes.
    pub fn shutdown(&self) -> SyncResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let role = self.tracker.current_role();
        self.tracker.stop();
        self.replicator.stop();
        self.durable.stop();

        let persisted = if role.is_leader && self.durable.is_unsynced() {
            self.durable.persist_if_leader(&self.store, &role).map(|_| ())
        } else {
            Ok(())
        };

        self.oracle.resign();
        self.channel.close();
        info!(store = self.store.name(), client = %self.client_id, was_leader = role.is_leader, "client shut down");
        persisted
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SyncError::ShutDown)
        } else {
            Ok(())
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(store = self.store.name(), error = %e, "final persist failed during drop");
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.client_id)
            .field("store", &self.store)
            .field("state", &self.lifecycle.state())
            .finish()
    }
}
