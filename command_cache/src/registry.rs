//! Per-key mutual exclusion with reference-counted lock handles.
//!
//! Each key in the registry maps to a slot holding the key's mutex and the
//! number of callers that currently hold or wait for it. A slot moves through
//! `absent -> held(n) -> ... -> held(1) -> absent`:
//!
//! * checkout: get-or-create the slot and increment `holders`, in one step
//!   under the map's shard lock.
//! * checkin: decrement `holders` and remove the slot when it reaches zero,
//!   again in one step under the shard lock.
//!
//! Removing a slot while another caller still holds a clone of its mutex would
//! let a third caller create a fresh mutex for the same key and run alongside
//! the second one. The counter makes that impossible.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

struct Slot {
    lock: Arc<Mutex<()>>,
    holders: usize,
}

impl Slot {
    fn new() -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            holders: 0,
        }
    }
}

/// Registry of per-key locks. Only keys with live callers occupy memory.
#[derive(Default)]
pub struct LockRegistry {
    slots: DashMap<String, Slot>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    ///
    /// The guard releases the key when dropped. If the returned future is
    /// dropped while still waiting, the caller's reference is given back.
    pub async fn acquire(&self, key: &str) -> KeyGuard<'_> {
        let lock = self.checkout(key);
        let mut guard = KeyGuard {
            registry: self,
            key: key.to_string(),
            held: None,
        };
        guard.held = Some(lock.lock_owned().await);
        guard
    }

    /// Number of keys with at least one holder or waiter.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn checkout(&self, key: &str) -> Arc<Mutex<()>> {
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(Slot::new);
        slot.holders += 1;
        slot.lock.clone()
    }

    fn checkin(&self, key: &str) {
        if let Entry::Occupied(mut slot) = self.slots.entry(key.to_string()) {
            let remaining = {
                let slot = slot.get_mut();
                slot.holders -= 1;
                slot.holders
            };
            if remaining == 0 {
                slot.remove();
            }
        }
    }
}

/// Exclusive access to one key. Unlocks, then checks the slot back in, on drop.
pub struct KeyGuard<'a> {
    registry: &'a LockRegistry,
    key: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for KeyGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard")
            .field("key", &self.key)
            .field("held", &self.held.is_some())
            .finish()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        self.registry.checkin(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_slot_removed_after_release() {
        let registry = LockRegistry::new();

        let guard = registry.acquire("1+deploy").await;
        assert_eq!(guard.key(), "1+deploy");
        assert_eq!(registry.len(), 1);

        drop(guard);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let registry = LockRegistry::new();
        let first = registry.acquire("1+deploy").await;

        let blocked = timeout(Duration::from_millis(50), registry.acquire("1+deploy")).await;
        assert!(blocked.is_err());

        drop(first);
        let second = timeout(Duration::from_millis(50), registry.acquire("1+deploy")).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_woken_on_release() {
        let registry = LockRegistry::new();
        let first = registry.acquire("1+deploy").await;

        let mut waiter = tokio_test::task::spawn(registry.acquire("1+deploy"));
        tokio_test::assert_pending!(waiter.poll());
        assert_eq!(registry.len(), 1);

        drop(first);
        assert!(waiter.is_woken());
        let guard = tokio_test::assert_ready!(waiter.poll());
        assert_eq!(guard.key(), "1+deploy");
        assert!(format!("{:?}", guard).contains("1+deploy"));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let registry = LockRegistry::new();
        let _first = registry.acquire("1+deploy").await;

        let other = timeout(Duration::from_millis(50), registry.acquire("2+deploy")).await;
        assert!(other.is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_waiter_keeps_slot_alive() {
        let registry = Arc::new(LockRegistry::new());
        let first = registry.acquire("5+build").await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.acquire("5+build").await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The holder leaves while the waiter is queued; the slot must survive.
        drop(first);
        assert_eq!(registry.len(), 1);

        waiter.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_waiter_releases_reference() {
        let registry = Arc::new(LockRegistry::new());
        let first = registry.acquire("5+build").await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.acquire("5+build").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(first);
        assert!(registry.is_empty());
    }
}
