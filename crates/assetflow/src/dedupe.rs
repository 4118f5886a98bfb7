//! In-flight request deduplication.
//!
//! Collapses concurrent requests for the same logical resource into a single
//! underlying operation. The first caller for a key becomes the leader and
//! runs the operation; every later caller for the same key joins the pending
//! operation and receives a clone of the leader's outcome. The registration
//! is removed when the operation settles, so a later call for the same key
//! starts a fresh operation — this is dedupe, not a result cache.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::oneshot;

/// Registry of pending operations keyed by logical request identity.
///
/// `V` is the settled outcome delivered to every joiner; it must be `Clone`
/// so a single resolution (value or failure) can fan out.
#[derive(Debug)]
pub struct InflightRegistry<K, V> {
    pending: Mutex<HashMap<K, Vec<oneshot::Sender<V>>>>,
}

impl<K, V> Default for InflightRegistry<K, V> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> InflightRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a pending operation.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Run `factory` for `key`, or join an operation already pending for it.
    ///
    /// Exactly one underlying operation runs per key at a time. If the
    /// leader's future is dropped before settling, one waiting joiner is
    /// promoted to leader and runs its own `factory`.
    pub async fn run_or_join<F, Fut>(&self, key: K, factory: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        loop {
            let rx = {
                let mut pending = self.pending.lock().unwrap();
                if let Some(waiters) = pending.get_mut(&key) {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                } else {
                    pending.insert(key.clone(), Vec::new());
                    None
                }
            };

            let Some(rx) = rx else {
                break;
            };

            if let Ok(value) = rx.await {
                return value;
            }
            // The leader was dropped before settling; race to become the
            // new leader on the next pass.
        }

        // Leader path. The guard unregisters the key if this future is
        // dropped mid-operation so waiters can re-elect.
        let guard = LeaderGuard {
            registry: self,
            key: Some(key),
        };

        let value = factory().await;
        guard.settle(value.clone());
        value
    }
}

/// Removes the leader's registration on drop so joined callers never hang
/// on a cancelled operation.
struct LeaderGuard<'a, K, V>
where
    K: Eq + Hash,
{
    registry: &'a InflightRegistry<K, V>,
    key: Option<K>,
}

impl<K, V> LeaderGuard<'_, K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Broadcast the settled outcome to all joiners and unregister the key.
    fn settle(mut self, value: V) {
        let key = self.key.take().expect("leader key taken twice");
        let waiters = self
            .registry
            .pending
            .lock()
            .unwrap()
            .remove(&key)
            .unwrap_or_default();
        for tx in waiters {
            // A joiner that stopped waiting is not an error.
            let _ = tx.send(value.clone());
        }
    }
}

impl<K, V> Drop for LeaderGuard<'_, K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            // Dropping the senders wakes every joiner with an error,
            // prompting re-election.
            self.registry.pending.lock().unwrap().remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_single_caller_runs_factory() {
        let registry = InflightRegistry::new();
        let value = registry.run_or_join("a", || async { 42 }).await;
        assert_eq!(value, 42);
        assert_eq!(registry.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_operation() {
        let registry = Arc::new(InflightRegistry::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let runs = Arc::clone(&runs);
            let gate = Arc::clone(&gate);
            tasks.push(tokio::spawn(async move {
                registry
                    .run_or_join("key", || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        7u32
                    })
                    .await
            }));
        }

        // Let all callers register before releasing the leader.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        gate.notify_waiters();

        for task in tasks {
            assert_eq!(task.await.unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_settled_key_starts_fresh_operation() {
        let registry = InflightRegistry::new();
        let first = registry.run_or_join("k", || async { 1 }).await;
        let second = registry.run_or_join("k", || async { 2 }).await;
        assert_eq!((first, second), (1, 2));
    }

    #[tokio::test]
    async fn test_joiners_observe_failure() {
        let registry: Arc<InflightRegistry<&str, Result<u32, String>>> =
            Arc::new(InflightRegistry::new());
        let gate = Arc::new(tokio::sync::Notify::new());

        let leader = {
            let registry = Arc::clone(&registry);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                registry
                    .run_or_join("k", || async move {
                        gate.notified().await;
                        Err("boom".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let joiner = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.run_or_join("k", || async { Ok(0) }).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        gate.notify_waiters();

        assert_eq!(leader.await.unwrap(), Err("boom".to_string()));
        assert_eq!(joiner.await.unwrap(), Err("boom".to_string()));
    }

    #[tokio::test]
    async fn test_dropped_leader_promotes_joiner() {
        let registry: Arc<InflightRegistry<&str, u32>> = Arc::new(InflightRegistry::new());

        let leader = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .run_or_join("k", || async {
                        std::future::pending::<()>().await;
                        0
                    })
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let joiner = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.run_or_join("k", || async { 5 }).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        leader.abort();
        assert_eq!(joiner.await.unwrap(), 5);
        assert_eq!(registry.pending_len(), 0);
    }
}
