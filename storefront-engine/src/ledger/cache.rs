//! Short-TTL read cache for ledger order lookups
//!
//! Only definite answers are cached. A failed lookup is never turned into
//! "not found".

use super::{ExternalLedger, LedgerError, LedgerOrderRow};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default lifetime of a cached lookup
pub const DEFAULT_LOOKUP_TTL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct LookupCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, Option<LedgerOrderRow>)>>,
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKUP_TTL)
    }
}

impl LookupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, order_id: &str) -> Option<Option<LedgerOrderRow>> {
        let mut entries = self.entries.lock();
        match entries.get(order_id) {
            Some((at, row)) if at.elapsed() < self.ttl => Some(row.clone()),
            Some(_) => {
                entries.remove(order_id);
                None
            }
            None => None,
        }
    }

    /// Look an order up, serving fresh cached answers
    pub async fn find_order(
        &self,
        ledger: &dyn ExternalLedger,
        order_id: &str,
        timeout: Duration,
    ) -> Result<Option<LedgerOrderRow>, LedgerError> {
        if let Some(hit) = self.cached(order_id) {
            return Ok(hit);
        }
        let row = match tokio::time::timeout(timeout, ledger.find_order(order_id)).await {
            Ok(result) => result?,
            Err(_) => return Err(LedgerError::Timeout),
        };
        self.entries
            .lock()
            .insert(order_id.to_string(), (Instant::now(), row.clone()));
        Ok(row)
    }

    /// Record a row we just wrote
    pub fn remember(&self, row: LedgerOrderRow) {
        self.entries
            .lock()
            .insert(row.order_id.clone(), (Instant::now(), Some(row)));
    }

    pub fn invalidate(&self, order_id: &str) {
        self.entries.lock().remove(order_id);
    }

    /// Drop expired entries
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (at, _)| at.elapsed() < self.ttl);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    #[tokio::test]
    async fn test_failure_is_not_cached_as_missing() {
        let ledger = MemoryLedger::new();
        let cache = LookupCache::default();

        ledger.set_failing(true);
        let err = cache
            .find_order(&ledger, "o1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::Unavailable);

        ledger.set_failing(false);
        let found = cache
            .find_order(&ledger, "o1", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_cached_answer_served_until_ttl() {
        let ledger = MemoryLedger::new();
        let cache = LookupCache::new(Duration::from_millis(30));
        assert!(
            cache
                .find_order(&ledger, "o1", Duration::from_secs(1))
                .await
                .unwrap()
                .is_none()
        );

        // A failing ledger is not consulted while the answer is fresh
        ledger.set_failing(true);
        assert!(
            cache
                .find_order(&ledger, "o1", Duration::from_secs(1))
                .await
                .is_ok()
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(
            cache
                .find_order(&ledger, "o1", Duration::from_secs(1))
                .await
                .is_err()
        );
    }
}
