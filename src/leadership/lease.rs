//! In-process lease registry
//!
//! A deterministic stand-in for a real election service: candidates join
//! in order, the oldest live candidate holds the lease, and the lease
//! moves only when its holder resigns or is expired explicitly. No timers
//! run, so tests decide exactly when leadership changes hands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use super::LeadershipOracle;
use crate::types::{LeaderInfo, LeaseState};
use crate::utils::now_millis;

struct Candidate {
    id: String,
    tx: broadcast::Sender<LeaseState>,
}

struct Registry {
    candidates: Vec<Candidate>,
    leader: Option<LeaderInfo>,
    available: bool,
}

/// Shared lease state for every client of one logical database
#[derive(Clone)]
pub struct LeaseRegistry {
    inner: Arc<Mutex<Registry>>,
    lease_duration: Duration,
}

impl LeaseRegistry {
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                candidates: Vec::new(),
                leader: None,
                available: true,
            })),
            lease_duration,
        }
    }

    /// Register a candidate; the first one becomes leader immediately
    pub fn join(&self, client_id: &str) -> LocalLeaseOracle {
        let (tx, _) = broadcast::channel(64);
        {
            let mut registry = self.inner.lock();
            registry.candidates.push(Candidate {
                id: client_id.to_string(),
                tx,
            });
            if registry.leader.is_none() {
                self.elect(&mut registry);
            } else if let Some(candidate) = registry.candidates.last() {
                let state = Self::state_for(&registry, &candidate.id);
                let _ = candidate.tx.send(state);
            }
        }
        LocalLeaseOracle {
            registry: self.clone(),
            client_id: client_id.to_string(),
            accept_external_writes: AtomicBool::new(false),
        }
    }

    /// Current lease holder
    pub fn leader_id(&self) -> Option<String> {
        self.inner.lock().leader.as_ref().map(|l| l.leader_id.clone())
    }

    /// Simulate the holder's lease running out without a clean resign
    pub fn expire_leader(&self) {
        let mut registry = self.inner.lock();
        if let Some(expired) = registry.leader.take() {
            info!(leader = %expired.leader_id, "lease expired");
            let position = registry
                .candidates
                .iter()
                .position(|c| c.id == expired.leader_id);
            let holder = position.map(|i| registry.candidates.remove(i));
            self.elect(&mut registry);
            // The old holder hears it lost the lease before its sender goes away
            if let Some(holder) = holder {
                let _ = holder.tx.send(Self::state_for(&registry, &holder.id));
            }
        }
    }

    /// Simulate the election service going away or coming back
    pub fn set_available(&self, available: bool) {
        let mut registry = self.inner.lock();
        registry.available = available;
        Self::notify_all(&registry);
    }

    fn remove(&self, client_id: &str) {
        let mut registry = self.inner.lock();
        registry.candidates.retain(|c| c.id != client_id);
        let was_leader = registry
            .leader
            .as_ref()
            .map(|l| l.leader_id == client_id)
            .unwrap_or(false);
        if was_leader {
            registry.leader = None;
            self.elect(&mut registry);
        }
    }

    fn elect(&self, registry: &mut Registry) {
        registry.leader = registry.candidates.first().map(|c| LeaderInfo {
            leader_id: c.id.clone(),
            expires_at_millis: now_millis() + self.lease_duration.as_millis() as i64,
        });
        if let Some(leader) = &registry.leader {
            info!(leader = %leader.leader_id, "lease granted");
        }
        Self::notify_all(registry);
    }

    fn state_for(registry: &Registry, client_id: &str) -> LeaseState {
        match (&registry.leader, registry.available) {
            (Some(leader), true) => LeaseState {
                is_leader: leader.leader_id == client_id,
                leader_id: Some(leader.leader_id.clone()),
            },
            _ => LeaseState::unknown(),
        }
    }

    fn notify_all(registry: &Registry) {
        for candidate in &registry.candidates {
            // Ignore errors - just means nobody is listening yet
            let _ = candidate.tx.send(Self::state_for(registry, &candidate.id));
        }
    }
}

impl Default for LeaseRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// One candidate's oracle on a [`LeaseRegistry`]
pub struct LocalLeaseOracle {
    registry: LeaseRegistry,
    client_id: String,
    accept_external_writes: AtomicBool,
}

impl LocalLeaseOracle {
    pub fn accepts_external_writes(&self) -> bool {
        self.accept_external_writes.load(Ordering::SeqCst)
    }
}

impl LeadershipOracle for LocalLeaseOracle {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn is_leader(&self) -> bool {
        self.lease_state().is_leader
    }

    fn leader_info(&self) -> Option<LeaderInfo> {
        let registry = self.registry.inner.lock();
        if registry.available {
            registry.leader.clone()
        } else {
            None
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<LeaseState> {
        let registry = self.registry.inner.lock();
        registry
            .candidates
            .iter()
            .find(|c| c.id == self.client_id)
            .map(|c| c.tx.subscribe())
            // Resigned candidates get a receiver that never fires
            .unwrap_or_else(|| broadcast::channel(1).1)
    }

    fn set_accept_external_writes(&self, accept: bool) {
        self.accept_external_writes.store(accept, Ordering::SeqCst);
    }

    fn resign(&self) {
        self.registry.remove(&self.client_id);
    }

    fn lease_state(&self) -> LeaseState {
        LeaseRegistry::state_for(&self.registry.inner.lock(), &self.client_id)
    }
}
