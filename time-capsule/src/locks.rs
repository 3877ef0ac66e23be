//! Per-capsule mutual exclusion.
//!
//! Mutations on one capsule are serialized; different capsules never wait
//! on each other. An entry lives only while some task holds or waits on
//! it, so the registry stays as small as the set of capsules in flight.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::CapsuleId;

/// Registry of per-capsule async mutexes.
#[derive(Debug, Default)]
pub struct CapsuleLocks {
    locks: DashMap<CapsuleId, Arc<Mutex<()>>>,
}

/// Held mutation scope for one capsule. Dropping it releases the mutex and
/// removes the registry entry when nobody else is queued on it.
#[derive(Debug)]
pub struct CapsuleGuard<'a> {
    locks: &'a CapsuleLocks,
    id: CapsuleId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl CapsuleLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the mutation scope for a capsule.
    pub async fn lock(&self, id: &CapsuleId) -> CapsuleGuard<'_> {
        // Clone the Arc out so the shard guard is released before awaiting.
        let mutex = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        CapsuleGuard {
            locks: self,
            id: id.clone(),
            guard: Some(guard),
        }
    }

    /// Remove the entry for `id` if no guard or waiter references it.
    ///
    /// The count is read under the shard write lock, and `lock` clones the
    /// Arc under that same lock, so a queued waiter always keeps its entry.
    fn release(&self, id: &CapsuleId) {
        self.locks
            .remove_if(id, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    /// Drop entries left behind by lock futures cancelled while queued.
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for CapsuleGuard<'_> {
    fn drop(&mut self) {
        // Unlock first; our own Arc clone goes with the owned guard.
        drop(self.guard.take());
        self.locks.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_different_capsules_do_not_block() {
        let locks = CapsuleLocks::new();
        let a = CapsuleId::new("a");
        let b = CapsuleId::new("b");

        let _guard_a = locks.lock(&a).await;
        let guard_b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&b)).await;
        assert!(guard_b.is_ok());
    }

    #[tokio::test]
    async fn test_same_capsule_serializes() {
        let locks = CapsuleLocks::new();
        let a = CapsuleId::new("a");

        let _guard = locks.lock(&a).await;
        let second = tokio::time::timeout(Duration::from_millis(50), locks.lock(&a)).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_released_entry_is_removed() {
        let locks = CapsuleLocks::new();
        let a = CapsuleId::new("a");

        let guard = locks.lock(&a).await;
        assert_eq!(locks.len(), 1);
        drop(guard);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_keeps_entry_alive() {
        let locks = Arc::new(CapsuleLocks::new());
        let a = CapsuleId::new("a");

        let first = locks.lock(&a).await;
        let waiter = {
            let locks = locks.clone();
            let a = a.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&a).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The waiter holds a clone of the mutex, so releasing must not
        // hand a third caller a fresh, unrelated mutex.
        drop(first);
        assert_eq!(locks.len(), 1);
        let third = tokio::time::timeout(Duration::from_millis(5), locks.lock(&a)).await;
        assert!(third.is_err());

        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_prune_drops_abandoned_entries() {
        let locks = CapsuleLocks::new();
        let a = CapsuleId::new("a");

        let guard = locks.lock(&a).await;
        let mut queued = tokio_test::task::spawn(locks.lock(&a));
        tokio_test::assert_pending!(queued.poll());

        // The holder leaves while a waiter is queued, then the waiter gives up.
        drop(guard);
        drop(queued);
        assert_eq!(locks.len(), 1);

        locks.prune();
        assert!(locks.is_empty());
    }
}
