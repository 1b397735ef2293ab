//! Single-flight cache of secondary resources
//!
//! Every key owns a [`OnceCell`]. The map mutex is held only while the
//! cell is looked up or removed; the remote creation runs inside the cell,
//! so unrelated keys never wait on each other and concurrent callers for
//! one key share a single in-flight creation.

use crate::error::Result;
use crate::resource::ScopedName;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;

/// A resolved resource and when it was resolved
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub resolved_at: DateTime<Utc>,
}

type Slot<V> = Arc<OnceCell<CacheEntry<V>>>;

/// Cache from [`ScopedName`] to a created-or-found resource
pub struct KeyedResourceCache<V> {
    slots: Mutex<HashMap<ScopedName, Slot<V>>>,
}

impl<V> Default for KeyedResourceCache<V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone + Send + Sync> KeyedResourceCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ScopedName, Slot<V>>> {
        // the map holds no invariant a panicking holder could break
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, key: &ScopedName) -> Slot<V> {
        self.slots().entry(key.clone()).or_default().clone()
    }

    /// Return the cached value for `key`, running `create` if there is none.
    ///
    /// While a creation is in flight, other callers for the same key wait
    /// for it. A failed creation leaves the key empty, so the next waiter
    /// (or a later caller) runs its own `create`.
    pub async fn get_or_create<F, Fut>(&self, key: &ScopedName, create: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let slot = self.slot(key);
        let entry = slot
            .get_or_try_init(|| async move {
                tracing::debug!(key = %key, "resolving secondary resource");
                let value = create().await?;
                Ok::<_, crate::ComputeError>(CacheEntry {
                    value,
                    resolved_at: Utc::now(),
                })
            })
            .await?;
        Ok(entry.value.clone())
    }

    /// Peek at a resolved value without creating one
    pub fn get(&self, key: &ScopedName) -> Option<V> {
        let slot = self.slots().get(key).cloned()?;
        slot.get().map(|entry| entry.value.clone())
    }

    /// Full entry (with resolution time) for `key`
    pub fn entry(&self, key: &ScopedName) -> Option<CacheEntry<V>> {
        let slot = self.slots().get(key).cloned()?;
        slot.get().cloned()
    }

    /// Forget `key`. The next `get_or_create` resolves it again.
    ///
    /// A creation already in flight finishes for its own waiters but is
    /// not remembered.
    pub fn invalidate(&self, key: &ScopedName) -> Option<V> {
        let slot = self.slots().remove(key)?;
        tracing::debug!(key = %key, "invalidated cache entry");
        slot.get().map(|entry| entry.value.clone())
    }

    /// Resolved keys in `scope`
    pub fn keys_in_scope(&self, scope: &str) -> Vec<ScopedName> {
        let mut keys: Vec<ScopedName> = self
            .slots()
            .iter()
            .filter(|(key, slot)| key.scope == scope && slot.initialized())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of resolved entries
    pub fn len(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ComputeError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key() -> ScopedName {
        ScopedName::new("tk1a", "fleet-web")
    }

    #[tokio::test]
    async fn test_sequential_calls_create_once() {
        let cache = KeyedResourceCache::new();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..2 {
            let value = cache
                .get_or_create(&key(), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("kp-1".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "kp-1");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_creation() {
        let cache = Arc::new(KeyedResourceCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_create(&key(), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(format!("created-by-{i}"))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &results[0]));
    }

    #[tokio::test]
    async fn test_failure_is_not_memoized() {
        let cache = KeyedResourceCache::<String>::new();

        let err = cache
            .get_or_create(&key(), || async {
                Err(ComputeError::Transport("503".into()))
            })
            .await;
        assert!(err.is_err());
        assert!(cache.get(&key()).is_none());

        let value = cache
            .get_or_create(&key(), || async { Ok("kp-2".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "kp-2");
    }

    #[tokio::test]
    async fn test_invalidate_forces_one_more_creation() {
        let cache = KeyedResourceCache::new();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let create = || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("kp-{n}"))
        };

        assert_eq!(cache.get_or_create(&key(), create).await.unwrap(), "kp-0");
        assert_eq!(cache.invalidate(&key()), Some("kp-0".to_string()));
        assert_eq!(cache.get_or_create(&key(), create).await.unwrap(), "kp-1");
        assert_eq!(cache.get_or_create(&key(), create).await.unwrap(), "kp-1");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_keys_in_scope_only_lists_resolved_entries() {
        let cache = KeyedResourceCache::new();
        cache
            .get_or_create(&ScopedName::new("tk1a", "b"), || async { Ok(1) })
            .await
            .unwrap();
        cache
            .get_or_create(&ScopedName::new("tk1a", "a"), || async { Ok(2) })
            .await
            .unwrap();
        cache
            .get_or_create(&ScopedName::new("is1a", "a"), || async { Ok(3) })
            .await
            .unwrap();
        let _ = cache
            .get_or_create(&ScopedName::new("tk1a", "failed"), || async {
                Err(ComputeError::Transport("timeout".into()))
            })
            .await;

        assert_eq!(
            cache.keys_in_scope("tk1a"),
            vec![ScopedName::new("tk1a", "a"), ScopedName::new("tk1a", "b")]
        );
        assert_eq!(cache.len(), 3);
    }
}
