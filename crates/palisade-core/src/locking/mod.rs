//! Per-key async locks
//!
//! Work on a single plugin id (install, rollback, lifecycle transitions) is
//! serialized by taking the lock for that id. Different ids never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Guard for a held key; the lock is released on drop
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Map of key -> mutex, created on demand
#[derive(Debug, Default)]
pub struct KeyedLocks {
    active_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and acquire the lock for `key`
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = self.mutex_for(key);
        let guard = mutex.lock_owned().await;
        trace!(key = %key, "Key lock acquired");
        KeyGuard {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Acquire the lock for `key` only if it is free right now
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        let mutex = self.mutex_for(key);
        mutex.try_lock_owned().ok().map(|guard| KeyGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// Drop the entry for `key` if nobody holds or waits on it
    pub fn forget(&self, key: &str) {
        self.active_locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    pub fn len(&self) -> usize {
        self.active_locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active_locks.is_empty()
    }

    fn mutex_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.active_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("a").await;
        assert_eq!(guard.key(), "a");
        assert!(locks.try_lock("a").is_none());
        drop(guard);
        assert!(locks.try_lock("a").is_some());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("a").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock("a").await;
            })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_forget_only_idle_keys() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("a").await;
        locks.forget("a");
        assert_eq!(locks.len(), 1);
        drop(guard);
        locks.forget("a");
        assert!(locks.is_empty());
    }
}
