//! Store creation arbitration
//!
//! Creating the same named store from two clients at once can corrupt
//! it, so before calling the engine's create primitive a client
//! negotiates on the init topic:
//!
//! ```text
//! INIT_REQUEST ──► wait init_wait ──► nobody objected ──► INIT_IN_PROGRESS ─► create ─► INIT_COMPLETE
//!                       │
//!                       └─► INIT_IN_PROGRESS / INIT_COMPLETE from a peer ──► defer
//! ```
//!
//! Two clients requesting inside the same window are ordered by client id:
//! the smaller id wins and the other defers. Each client answers a peer's
//! request with its own so late joiners still learn about it.
//!
//! Known limitation: there is no heartbeat. If the winner dies before
//! `INIT_COMPLETE`, deferred clients wait `init_complete_wait` and then
//! negotiate again.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::channel::{Channel, Subscription};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::types::{InitKind, InitMessage};

/// What the caller may do after negotiation
#[derive(Debug)]
pub enum InitDecision {
    /// This client holds the init right and must call `complete` after creating
    Create(InitGrant),
    /// Another client created the store, or it already existed
    Proceed,
}

impl InitDecision {
    pub fn can_create(&self) -> bool {
        matches!(self, InitDecision::Create(_))
    }
}

/// Held by the single client allowed to create the store
///
/// While held, peers that ask are told `INIT_IN_PROGRESS`. Dropping the
/// grant without calling [`InitGrant::complete`] stops answering but
/// announces nothing, so waiting peers eventually time out and retry.
pub struct InitGrant {
    client_id: String,
    store: String,
    topic: String,
    channel: Arc<dyn Channel>,
    responder: JoinHandle<()>,
}

impl InitGrant {
    /// Announce completion and leave the coordination topic
    pub fn complete(self) -> SyncResult<()> {
        self.responder.abort();
        let msg = InitMessage::new(InitKind::InitComplete, &self.client_id, &self.store);
        self.channel.publish(&self.topic, &msg.to_json()?)?;
        info!(store = %self.store, client = %self.client_id, "store creation complete");
        Ok(())
    }
}

impl Drop for InitGrant {
    fn drop(&mut self) {
        self.responder.abort();
    }
}

impl std::fmt::Debug for InitGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitGrant")
            .field("client_id", &self.client_id)
            .field("store", &self.store)
            .finish()
    }
}

enum Negotiation {
    Won,
    Completed,
    Deferred(String),
}

/// Negotiates the right to create a named store
pub struct InitCoordinator {
    client_id: String,
    channel: Arc<dyn Channel>,
    config: Arc<SyncConfig>,
}

impl InitCoordinator {
    pub fn new(client_id: &str, channel: Arc<dyn Channel>, config: Arc<SyncConfig>) -> Self {
        Self {
            client_id: client_id.to_string(),
            channel,
            config,
        }
    }

    /// Negotiate the init right for `store`
    ///
    /// `store_exists` is consulted after winning: a store that is already
    /// on disk needs no creation, and peers are released right away.
    pub async fn acquire_init_right<F>(&self, store: &str, store_exists: F) -> SyncResult<InitDecision>
    where
        F: Fn() -> bool,
    {
        let topic = self.config.init_topic(store);

        for attempt in 1..=self.config.init_attempts {
            let mut sub = self.channel.subscribe(&topic)?;
            self.send(&topic, InitKind::InitRequest, store)?;

            match self.negotiate(&mut sub, &topic, store).await? {
                Negotiation::Won if store_exists() => {
                    debug!(store, "store already exists, releasing peers");
                    self.send(&topic, InitKind::InitComplete, store)?;
                    return Ok(InitDecision::Proceed);
                }
                Negotiation::Won => {
                    info!(store, client = %self.client_id, attempt, "won init right");
                    self.send(&topic, InitKind::InitInProgress, store)?;
                    let responder = self.spawn_responder(sub, &topic, store);
                    return Ok(InitDecision::Create(InitGrant {
                        client_id: self.client_id.clone(),
                        store: store.to_string(),
                        topic,
                        channel: Arc::clone(&self.channel),
                        responder,
                    }));
                }
                Negotiation::Completed => return Ok(InitDecision::Proceed),
                Negotiation::Deferred(winner) => {
                    debug!(store, winner = %winner, "deferring store creation");
                    if self.wait_for_completion(&mut sub, store).await? {
                        return Ok(InitDecision::Proceed);
                    }
                    warn!(
                        store,
                        winner = %winner,
                        attempt,
                        "no INIT_COMPLETE within bound, negotiating again"
                    );
                }
            }
        }

        Err(SyncError::InitRaceTimeout {
            store: store.to_string(),
            attempts: self.config.init_attempts,
        })
    }

    fn send(&self, topic: &str, kind: InitKind, store: &str) -> SyncResult<()> {
        let msg = InitMessage::new(kind, &self.client_id, store);
        self.channel.publish(topic, &msg.to_json()?)
    }

    /// Next init message from another client about `store`
    async fn next_peer_message(
        &self,
        sub: &mut Subscription,
        store: &str,
        deadline: Instant,
    ) -> SyncResult<Option<InitMessage>> {
        loop {
            let raw = match timeout_at(deadline, sub.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(SyncError::Channel("init topic closed".to_string())),
                Ok(Some(raw)) => raw,
            };
            match InitMessage::from_json(&raw) {
                Ok(msg) if msg.client_id != self.client_id && msg.store == store => {
                    return Ok(Some(msg))
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "ignoring malformed init message"),
            }
        }
    }

    async fn negotiate(
        &self,
        sub: &mut Subscription,
        topic: &str,
        store: &str,
    ) -> SyncResult<Negotiation> {
        let deadline = Instant::now() + self.config.init_wait;
        let mut answered = HashSet::new();

        while let Some(msg) = self.next_peer_message(sub, store, deadline).await? {
            match msg.kind {
                InitKind::InitInProgress => return Ok(Negotiation::Deferred(msg.client_id)),
                InitKind::InitComplete => return Ok(Negotiation::Completed),
                InitKind::InitRequest if msg.client_id < self.client_id => {
                    return Ok(Negotiation::Deferred(msg.client_id))
                }
                InitKind::InitRequest => {
                    // Make sure the peer hears about us even if it joined late
                    if answered.insert(msg.client_id) {
                        self.send(topic, InitKind::InitRequest, store)?;
                    }
                }
            }
        }

        Ok(Negotiation::Won)
    }

    /// True once some peer announces `INIT_COMPLETE`, false on timeout
    async fn wait_for_completion(&self, sub: &mut Subscription, store: &str) -> SyncResult<bool> {
        let deadline = Instant::now() + self.config.init_complete_wait;
        while let Some(msg) = self.next_peer_message(sub, store, deadline).await? {
            if msg.kind == InitKind::InitComplete {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn spawn_responder(&self, mut sub: Subscription, topic: &str, store: &str) -> JoinHandle<()> {
        let channel = Arc::clone(&self.channel);
        let reply = InitMessage::new(InitKind::InitInProgress, &self.client_id, store);
        let client_id = self.client_id.clone();
        let store = store.to_string();
        let topic = topic.to_string();

        tokio::spawn(async move {
            let payload = match reply.to_json() {
                Ok(p) => p,
                Err(_) => return,
            };
            while let Some(raw) = sub.recv().await {
                let asked = matches!(
                    InitMessage::from_json(&raw),
                    Ok(msg) if msg.kind == InitKind::InitRequest
                        && msg.client_id != client_id
                        && msg.store == store
                );
                if asked && channel.publish(&topic, &payload).is_err() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalBus;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_config() -> Arc<SyncConfig> {
        Arc::new(
            SyncConfig::default()
                .with_init_wait(Duration::from_millis(50))
                .with_init_complete_wait(Duration::from_millis(500)),
        )
    }

    #[tokio::test]
    async fn test_single_client_wins() {
        let bus = LocalBus::default();
        let coordinator = InitCoordinator::new("a", Arc::new(bus.endpoint()), fast_config());

        let decision = coordinator.acquire_init_right("notes", || false).await.unwrap();
        assert!(decision.can_create());
        if let InitDecision::Create(grant) = decision {
            grant.complete().unwrap();
        }
    }

    #[tokio::test]
    async fn test_existing_store_needs_no_creation() {
        let bus = LocalBus::default();
        let coordinator = InitCoordinator::new("a", Arc::new(bus.endpoint()), fast_config());

        let decision = coordinator.acquire_init_right("notes", || true).await.unwrap();
        assert!(!decision.can_create());
    }

    #[tokio::test]
    async fn test_concurrent_clients_create_once() {
        let bus = LocalBus::default();
        let config = fast_config();
        let created = Arc::new(AtomicUsize::new(0));
        let exists = Arc::new(AtomicBool::new(false));

        let mut tasks = Vec::new();
        for id in ["c", "a", "d", "b"] {
            let coordinator = InitCoordinator::new(id, Arc::new(bus.endpoint()), config.clone());
            let created = created.clone();
            let exists = exists.clone();
            tasks.push(tokio::spawn(async move {
                let probe = exists.clone();
                let decision = coordinator
                    .acquire_init_right("notes", move || probe.load(Ordering::SeqCst))
                    .await
                    .unwrap();
                match decision {
                    InitDecision::Create(grant) => {
                        created.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        exists.store(true, Ordering::SeqCst);
                        grant.complete().unwrap();
                    }
                    // Losers only proceed after the store exists
                    InitDecision::Proceed => assert!(exists.load(Ordering::SeqCst)),
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_joiner_defers_to_creator_in_progress() {
        let bus = LocalBus::default();
        let config = fast_config();
        let winner = InitCoordinator::new("z", Arc::new(bus.endpoint()), config.clone());
        let grant = match winner.acquire_init_right("notes", || false).await.unwrap() {
            InitDecision::Create(grant) => grant,
            InitDecision::Proceed => panic!("first client must win"),
        };

        // Smaller id, but creation is already under way
        let late = InitCoordinator::new("a", Arc::new(bus.endpoint()), config);
        let waiter = tokio::spawn(async move { late.acquire_init_right("notes", || true).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        grant.complete().unwrap();

        let decision = waiter.await.unwrap().unwrap();
        assert!(!decision.can_create());
    }

    #[tokio::test]
    async fn test_crashed_winner_times_out_and_loser_retries() {
        let bus = LocalBus::default();
        let config = Arc::new(
            SyncConfig::default()
                .with_init_wait(Duration::from_millis(30))
                .with_init_complete_wait(Duration::from_millis(60)),
        );

        // Winner announces progress, then disappears without completing
        let crashed = InitCoordinator::new("a", Arc::new(bus.endpoint()), config.clone());
        let grant = crashed.acquire_init_right("notes", || false).await.unwrap();
        let survivor = InitCoordinator::new("b", Arc::new(bus.endpoint()), config);
        let handle = tokio::spawn(async move { survivor.acquire_init_right("notes", || false).await });

        tokio::time::sleep(Duration::from_millis(40)).await;
        drop(grant);

        let decision = handle.await.unwrap().unwrap();
        assert!(decision.can_create());
    }
}
