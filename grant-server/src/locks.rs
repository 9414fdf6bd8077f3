use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockTable = Arc<Mutex<HashMap<String, Slot>>>;

struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    /// Holders plus waiters of the key
    claims: usize,
}

/// A set of async mutexes addressed by string key.
///
/// Holders of different keys never wait on each other; holders of the same
/// key are served one at a time. Entries are removed from the table as soon
/// as the last holder or waiter of a key is gone, including waiters whose
/// future was dropped before acquiring, so the table only ever contains keys
/// that are currently contended.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    table: LockTable,
}

/// Registration of one holder or waiter on a key
struct Claim {
    key: String,
    table: LockTable,
}

impl Claim {
    fn register(table: &LockTable, key: &str) -> (Self, Arc<AsyncMutex<()>>) {
        let mut slots = table.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            mutex: Arc::default(),
            claims: 0,
        });
        slot.claims += 1;
        let claim = Self {
            key: key.to_string(),
            table: Arc::clone(table),
        };
        (claim, Arc::clone(&slot.mutex))
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut slots = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.claims = slot.claims.saturating_sub(1);
            if slot.claims == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

/// Exclusive hold on one key, released on drop
pub struct KeyGuard {
    // fields drop in order: the mutex is released before the claim goes
    _guard: OwnedMutexGuard<()>,
    _claim: Claim,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let (claim, mutex) = Claim::register(&self.table, key);
        let guard = mutex.lock_owned().await;
        KeyGuard {
            _guard: guard,
            _claim: claim,
        }
    }

    /// Number of keys currently held or awaited
    #[cfg(test)]
    pub fn active_keys(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("grant-1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;

        let acquired = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(acquired.is_ok(), "unrelated key should not wait");
        assert_eq!(locks.active_keys(), 2);
    }

    #[tokio::test]
    async fn test_table_is_pruned_after_release() {
        let locks = KeyedLocks::new();
        {
            let _guard = locks.lock("short-lived").await;
            assert_eq!(locks.active_keys(), 1);
        }
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_pruned() {
        let locks = KeyedLocks::new();
        let holder = locks.lock("grant-1").await;

        let waited = tokio::time::timeout(Duration::from_millis(20), locks.lock("grant-1")).await;
        assert!(waited.is_err(), "key is held");
        assert_eq!(locks.active_keys(), 1);

        // a queued waiter outlives a cancelled one and still gets the key
        let queued = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("grant-1").await;
            })
        };
        let cancelled = tokio::time::timeout(Duration::from_millis(20), locks.lock("grant-1")).await;
        assert!(cancelled.is_err());
        drop(holder);
        queued.await.unwrap();

        assert_eq!(locks.active_keys(), 0);
    }
}
