//! Role tracking on top of an oracle
//!
//! One background task per client drains the oracle's notifications and
//! runs the registered callbacks sequentially, once per actual change,
//! in the order changes happen.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::LeadershipOracle;
use crate::error::{SyncError, SyncResult};
use crate::types::LeaseState;

/// Callback invoked with the new state after each role change
pub type RoleCallback = Box<dyn Fn(&LeaseState) + Send + Sync>;

type SharedCallback = Arc<dyn Fn(&LeaseState) + Send + Sync>;

/// Exposes the client's current role and role-change events
pub struct LeadershipTracker {
    state: watch::Sender<LeaseState>,
    callbacks: Mutex<Vec<SharedCallback>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeadershipTracker {
    /// Start tracking; must be called inside a tokio runtime
    pub fn start(oracle: Arc<dyn LeadershipOracle>) -> Arc<Self> {
        // Subscribe before reading so no transition falls in between
        let rx = oracle.subscribe();
        let initial = oracle.lease_state();
        debug!(client = %oracle.client_id(), ?initial, "leadership tracker started");

        let (state, _) = watch::channel(initial);
        let tracker = Arc::new(Self {
            state,
            callbacks: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::run(Arc::downgrade(&tracker), oracle, rx));
        *tracker.task.lock() = Some(task);
        tracker
    }

    async fn run(
        tracker: std::sync::Weak<Self>,
        oracle: Arc<dyn LeadershipOracle>,
        mut rx: broadcast::Receiver<LeaseState>,
    ) {
        loop {
            let next = match rx.recv().await {
                Ok(state) => state,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "role notifications lagged, resyncing from oracle");
                    oracle.lease_state()
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match tracker.upgrade() {
                Some(tracker) => tracker.observe(next),
                None => break,
            }
        }
    }

    /// Record a state and fire callbacks if it differs from the last one
    fn observe(&self, next: LeaseState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if !changed {
            return;
        }

        info!(is_leader = next.is_leader, leader = ?next.leader_id, "role changed");
        // Callbacks may register more callbacks or stop the tracker
        let callbacks: Vec<SharedCallback> = self.callbacks.lock().clone();
        for callback in callbacks {
            callback(&next);
        }
    }

    /// Latest known role; "follower, leader unknown" until the oracle answers
    pub fn current_role(&self) -> LeaseState {
        self.state.borrow().clone()
    }

    /// Register a callback for every subsequent role change
    pub fn on_role_change(&self, callback: RoleCallback) {
        self.callbacks.lock().push(Arc::from(callback));
    }

    /// Wait until `predicate` holds for the current role, bounded by `bound`
    pub async fn wait_until<F>(&self, bound: Duration, predicate: F) -> SyncResult<LeaseState>
    where
        F: FnMut(&LeaseState) -> bool,
    {
        let mut rx = self.state.subscribe();
        let outcome = tokio::time::timeout(bound, rx.wait_for(predicate)).await;
        let state = match outcome {
            Ok(Ok(state)) => state.clone(),
            Ok(Err(_)) => return Err(SyncError::ShutDown),
            Err(_) => return Err(SyncError::LeadershipTimeout(bound.as_millis() as u64)),
        };
        Ok(state)
    }

    /// Wait for the first leadership decision after cold start
    pub async fn wait_for_determination(&self, bound: Duration) -> SyncResult<LeaseState> {
        self.wait_until(bound, LeaseState::is_determined).await
    }

    /// Stop consuming notifications and drop every callback
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.callbacks.lock().clear();
    }
}

impl Drop for LeadershipTracker {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leadership::LeaseRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_initial_role_from_oracle() {
        let registry = LeaseRegistry::default();
        let a = Arc::new(registry.join("a"));
        let tracker = LeadershipTracker::start(a);

        assert_eq!(tracker.current_role(), LeaseState::leader("a"));
        tracker.stop();
    }

    #[tokio::test]
    async fn test_callbacks_fire_once_per_transition_in_order() {
        let registry = LeaseRegistry::default();
        let a = registry.join("a");
        let _b = registry.join("b");
        let c = Arc::new(registry.join("c"));
        let tracker = LeadershipTracker::start(c);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        tracker.on_role_change(Box::new(move |state| sink.lock().push(state.clone())));

        a.resign();
        registry.expire_leader();
        tracker
            .wait_until(Duration::from_secs(1), |s| s.is_leader)
            .await
            .unwrap();

        assert_eq!(
            *seen.lock(),
            vec![LeaseState::follower("b"), LeaseState::leader("c")]
        );
    }

    #[tokio::test]
    async fn test_duplicate_notifications_are_suppressed() {
        let registry = LeaseRegistry::default();
        let _a = registry.join("a");
        let b = Arc::new(registry.join("b"));
        let tracker = LeadershipTracker::start(b);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        tracker.on_role_change(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // A newcomer triggers no change for b
        let _c = registry.join("c");
        registry.set_available(false);
        tracker
            .wait_until(Duration::from_secs(1), |s| !s.is_determined())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_oracle_defaults_to_follower() {
        let registry = LeaseRegistry::default();
        registry.set_available(false);
        let a = Arc::new(registry.join("a"));
        let tracker = LeadershipTracker::start(a);

        assert_eq!(tracker.current_role(), LeaseState::unknown());
        let err = tracker
            .wait_for_determination(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::LeadershipTimeout(20)));
    }

    async fn settle(calls: &AtomicUsize, expected: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(1), async {
            while calls.load(Ordering::SeqCst) != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "callbacks stalled at {}", calls.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callback_can_register_another_callback() {
        let registry = LeaseRegistry::default();
        let a = registry.join("a");
        let b = Arc::new(registry.join("b"));
        let _c = registry.join("c");
        let tracker = LeadershipTracker::start(b);

        let outer_calls = Arc::new(AtomicUsize::new(0));
        let nested_calls = Arc::new(AtomicUsize::new(0));
        let inner_tracker = Arc::downgrade(&tracker);
        let (outer, nested) = (outer_calls.clone(), nested_calls.clone());
        tracker.on_role_change(Box::new(move |_| {
            outer.fetch_add(1, Ordering::SeqCst);
            if let Some(tracker) = inner_tracker.upgrade() {
                let nested = nested.clone();
                tracker.on_role_change(Box::new(move |_| {
                    nested.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }));

        a.resign();
        settle(&outer_calls, 1).await;
        assert!(tracker.current_role().is_leader);

        // The tracker still observes changes after the nested registration
        registry.expire_leader();
        settle(&outer_calls, 2).await;
        settle(&nested_calls, 1).await;
        assert_eq!(tracker.current_role(), LeaseState::follower("c"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callback_can_stop_its_tracker() {
        let registry = LeaseRegistry::default();
        let a = registry.join("a");
        let b = Arc::new(registry.join("b"));
        let tracker = LeadershipTracker::start(b);

        let calls = Arc::new(AtomicUsize::new(0));
        let inner_tracker = Arc::downgrade(&tracker);
        let counter = calls.clone();
        tracker.on_role_change(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(tracker) = inner_tracker.upgrade() {
                tracker.stop();
            }
        }));

        a.resign();
        settle(&calls, 1).await;

        // Registration does not block once the stopping callback returned
        let handle = tracker.clone();
        let registered = tokio::time::timeout(
            Duration::from_secs(1),
            tokio::task::spawn_blocking(move || handle.on_role_change(Box::new(|_| {}))),
        )
        .await;
        assert!(matches!(registered, Ok(Ok(()))));
        assert!(tracker.current_role().is_leader);
    }

    #[tokio::test]
    async fn test_stop_unsubscribes_callbacks() {
        let registry = LeaseRegistry::default();
        let a = registry.join("a");
        let b = Arc::new(registry.join("b"));
        let tracker = LeadershipTracker::start(b);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        tracker.on_role_change(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tracker.stop();
        a.resign();
        tokio::task::yield_now().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!tracker.current_role().is_leader);
    }
}
