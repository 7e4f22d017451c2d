//! In-flight request coalescing
//!
//! Collapses concurrent identical reads into one underlying query. The first
//! caller for a key becomes the producer; everyone else arriving before the
//! producer settles registers a waiter and receives a clone of the same
//! outcome, success or failure.
//!
//! The registry entry is removed on every exit path. A producer that fails
//! still clears its registration before any waiter is notified, and a producer
//! that is dropped mid-flight clears it from the scope guard, so a key can
//! never be wedged behind a dead entry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{DataSourceError, Result};

type Notifier<T> = oneshot::Sender<Result<T>>;

/// Registry of keys with a production currently in flight.
///
/// Owned by one data source instance and scoped to its lifetime; not
/// process-wide state.
pub struct InflightMap<T> {
    inflights: Mutex<HashMap<String, Vec<Notifier<T>>>>,
}

impl<T> Default for InflightMap<T> {
    fn default() -> Self {
        Self {
            inflights: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> InflightMap<T> {
    fn remove(&self, key: &str) -> Vec<Notifier<T>> {
        let mut inflights = self
            .inflights
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        inflights.remove(key).unwrap_or_default()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inflights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T: Clone> InflightMap<T> {
    /// Join the in-flight production for `key`, or become its producer.
    ///
    /// `produce` is invoked at most once across all concurrent callers of the
    /// same key. Callers of unrelated keys proceed independently; no lock is
    /// held across an await.
    pub async fn coalesce<F, Fut>(&self, key: &str, produce: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // Check-then-insert is a single critical section, otherwise two
        // callers could both observe a vacant entry and both invoke `produce`.
        // The guard's scope must end before any await so the future stays Send.
        let rx = {
            let mut inflights = self
                .inflights
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(notifiers) = inflights.get_mut(key) {
                let (tx, rx) = oneshot::channel();
                notifiers.push(tx);
                Some(rx)
            } else {
                inflights.insert(key.to_string(), Vec::new());
                None
            }
        };
        if let Some(rx) = rx {
            debug!(key = key, "Joined in-flight query");
            return match rx.await {
                Ok(result) => result,
                // Producer dropped without settling. Its guard has already
                // cleared the registration, so a retry starts fresh.
                Err(_) => Err(DataSourceError::InflightAbandoned),
            };
        }

        let guard = SettleGuard { map: self, key };
        let result = produce().await;
        guard.settle(&result);
        result
    }
}

/// Clears the producer's registration when it settles or is dropped.
struct SettleGuard<'a, T> {
    map: &'a InflightMap<T>,
    key: &'a str,
}

impl<T: Clone> SettleGuard<'_, T> {
    fn settle(self, result: &Result<T>) {
        for notifier in self.map.remove(self.key) {
            // A waiter may itself have been dropped; nothing to deliver then
            let _ = notifier.send(result.clone());
        }
        std::mem::forget(self);
    }
}

impl<T> Drop for SettleGuard<'_, T> {
    fn drop(&mut self) {
        // Reached only when the producing future was dropped mid-flight.
        // Dropping the notifiers closes every waiter's channel.
        self.map.remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_single_producer_for_concurrent_callers() {
        let map = InflightMap::<u64>::default();
        let calls = AtomicUsize::new(0);

        let produce = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            Ok(42u64)
        };

        let (a, b, c) = tokio::join!(
            map.coalesce("k", produce),
            map.coalesce("k", produce),
            map.coalesce("k", produce),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), 42);
        assert_eq!(b.unwrap(), 42);
        assert_eq!(c.unwrap(), 42);
        assert_eq!(map.len(), 0);
    }

    #[tokio::test]
    async fn test_unrelated_keys_do_not_coalesce() {
        let map = InflightMap::<u64>::default();
        let calls = AtomicUsize::new(0);

        let produce = |v: u64| {
            let calls = &calls;
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(10)).await;
                Ok(v)
            }
        };

        let (a, b) = tokio::join!(map.coalesce("a", produce(1)), map.coalesce("b", produce(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_registration_cleared() {
        let map = InflightMap::<u64>::default();
        let calls = AtomicUsize::new(0);

        let produce = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(10)).await;
            Err(DataSourceError::Database("boom".into()))
        };

        let (a, b) = tokio::join!(map.coalesce("k", produce), map.coalesce("k", produce));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap_err(), DataSourceError::Database("boom".into()));
        assert_eq!(b.unwrap_err(), DataSourceError::Database("boom".into()));

        // The failed entry must not wedge later callers for the same key
        assert_eq!(map.len(), 0);
        let retry = map
            .coalesce("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7u64)
            })
            .await;
        assert_eq!(retry.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abandoned_producer_releases_waiters() {
        let map = Arc::new(InflightMap::<u64>::default());

        let producer_map = map.clone();
        let producer = tokio::spawn(async move {
            producer_map
                .coalesce("k", || futures_util::future::pending::<Result<u64>>())
                .await
        });
        // Let the producer register before the waiter joins
        tokio::task::yield_now().await;
        assert_eq!(map.len(), 1);

        let waiter_map = map.clone();
        let waiter = tokio::spawn(async move {
            waiter_map.coalesce("k", || async { Ok(1u64) }).await
        });
        tokio::task::yield_now().await;

        producer.abort();
        let result = waiter.await.expect("waiter task panicked");
        assert_eq!(result.unwrap_err(), DataSourceError::InflightAbandoned);

        // Registration was cleared by the guard; a fresh call produces
        assert_eq!(map.len(), 0);
        let fresh = map.coalesce("k", || async { Ok(9u64) }).await;
        assert_eq!(fresh.unwrap(), 9);
    }
}
