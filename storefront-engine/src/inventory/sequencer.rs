//! Per-SKU mutation sequencer
//!
//! 每个 SKU 一把异步互斥锁（tokio Mutex 为 FIFO 公平锁），
//! 不同 SKU 的扣减/回补可以并发执行。

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Guard held while mutating one SKU
pub type SkuGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct SkuSequencer {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SkuSequencer {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, sku: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(sku.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to one SKU
    pub async fn acquire(&self, sku: &str) -> SkuGuard {
        self.lock_for(sku).lock_owned().await
    }

    /// Acquire several SKUs at once
    ///
    /// Locks are taken in sorted order with duplicates removed, so two callers
    /// with overlapping SKU sets cannot deadlock.
    pub async fn acquire_many<'a, I>(&self, skus: I) -> Vec<SkuGuard>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut sorted: Vec<&str> = skus.into_iter().collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for sku in sorted {
            guards.push(self.acquire(sku).await);
        }
        guards
    }

    /// Remove idle entries (no holder, no waiter)
    ///
    /// Returns the number of entries removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
