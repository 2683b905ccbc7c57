//! Sync Worker - drains the outbox into the external ledger
//!
//! Event-driven (a notification per enqueued key) plus a periodic scan that
//! picks up retries and anything enqueued before a restart.
//!
//! Delivery rules:
//! - entries are processed oldest first, one at a time
//! - a `commit` waits while the same order's `append` is still pending
//! - before an `append` the ledger is asked whether it already has the row
//!   (through [`LookupCache`]); a failed lookup is a retryable error
//! - failures persist `attempts`/`last_error` and back off exponentially
//!   (base 5s, capped); transient failures retry without limit
//! - an entry the ledger keeps rejecting (4xx, undecodable response) moves to
//!   the dead-letter table after [`MAX_REJECTED_ATTEMPTS`]
//! - a `commit` for an order that was never confirmed is discarded
//! - local stock is never touched here; the catalog is only told that a
//!   stock delta was acknowledged
//!
//! Note: redb operations are synchronous.

use super::cache::LookupCache;
use super::{ExternalLedger, LedgerError, LedgerOrderRow};
use crate::orders::OrderStorage;
use crate::orders::outbox::{OutboxEntry, OutboxKind, SyncOp};
use crate::services::CatalogService;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RETRY_BASE_DELAY_SECS: u64 = 5;
const RETRY_MAX_DELAY_SECS: u64 = 300; // 5 minutes max
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 30;

/// Non-retryable failures tolerated before an entry is dead-lettered
pub const MAX_REJECTED_ATTEMPTS: u32 = 5;

/// Delay before the next attempt after `attempts` failures
pub fn backoff_delay(attempts: u32) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    let factor = 2u64.saturating_pow(attempts - 1);
    Duration::from_secs(
        RETRY_BASE_DELAY_SECS
            .saturating_mul(factor)
            .min(RETRY_MAX_DELAY_SECS),
    )
}

/// Whether an entry is due at `now`
fn is_due(entry: &OutboxEntry, now: i64) -> bool {
    match entry.last_attempt_at {
        None => true,
        Some(last) => {
            let delay_ms = backoff_delay(entry.attempts).as_millis() as i64;
            now >= last.saturating_add(delay_ms)
        }
    }
}

enum Delivery {
    Done,
    /// Commit waiting for its append
    Held,
    /// Nothing left to mirror (order purged, or never confirmed)
    Dropped(&'static str),
}

/// Counters of one drain pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    pub held: usize,
    pub dropped: usize,
    pub dead_lettered: usize,
    pub not_due: usize,
}

/// Outbox drain worker
pub struct SyncWorker {
    storage: OrderStorage,
    ledger: Arc<dyn ExternalLedger>,
    catalog: Arc<CatalogService>,
    lookup: LookupCache,
    call_timeout: Duration,
    scan_interval: Duration,
}

impl SyncWorker {
    pub fn new(
        storage: OrderStorage,
        ledger: Arc<dyn ExternalLedger>,
        catalog: Arc<CatalogService>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            ledger,
            catalog,
            lookup: LookupCache::default(),
            call_timeout,
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
        }
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Run until shutdown or until the notification channel closes
    pub async fn run(self, mut notify_rx: mpsc::Receiver<String>, shutdown: CancellationToken) {
        tracing::info!(scan_interval_secs = self.scan_interval.as_secs(), "SyncWorker started");

        // Entries left over from the previous run
        self.drain(shared::util::now_millis()).await;

        let mut scan_interval = tokio::time::interval(self.scan_interval);
        scan_interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("SyncWorker received shutdown signal");
                    break;
                }
                key = notify_rx.recv() => {
                    match key {
                        Some(key) => {
                            tracing::debug!(key = %key, "Outbox entry enqueued");
                            // Coalesce a burst of notifications into one pass
                            while notify_rx.try_recv().is_ok() {}
                            self.drain(shared::util::now_millis()).await;
                        }
                        None => {
                            tracing::info!("Outbox channel closed, shutting down SyncWorker");
                            break;
                        }
                    }
                }
                _ = scan_interval.tick() => {
                    self.drain(shared::util::now_millis()).await;
                    self.lookup.purge_expired();
                }
            }
        }
    }

    /// Deliver every due entry once
    pub async fn drain(&self, now: i64) -> DrainReport {
        let mut report = DrainReport::default();
        let pending = match self.storage.get_pending_outbox() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read outbox");
                return report;
            }
        };
        if pending.is_empty() {
            return report;
        }

        for entry in pending {
            if !is_due(&entry, now) {
                report.not_due += 1;
                continue;
            }
            match self.deliver(&entry).await {
                Ok(Delivery::Done) => {
                    if let Err(e) = self.storage.complete_outbox(&entry) {
                        tracing::error!(key = %entry.key, error = %e, "Failed to complete outbox entry");
                        continue;
                    }
                    if matches!(entry.op, SyncOp::AdjustStock { .. }) {
                        self.catalog.note_stock_acknowledged();
                    }
                    tracing::info!(key = %entry.key, attempts = entry.attempts, "Outbox entry delivered");
                    report.delivered += 1;
                }
                Ok(Delivery::Held) => {
                    tracing::debug!(key = %entry.key, "Commit held until append is delivered");
                    report.held += 1;
                }
                Ok(Delivery::Dropped(reason)) => {
                    if let Err(e) = self.storage.discard_outbox(&entry.key) {
                        tracing::error!(key = %entry.key, error = %e, "Failed to discard outbox entry");
                    }
                    tracing::warn!(key = %entry.key, reason, "Outbox entry discarded");
                    report.dropped += 1;
                }
                Err(e) => {
                    let attempts = entry.attempts + 1;
                    if e.is_retryable() {
                        tracing::warn!(key = %entry.key, attempts, error = %e, "Ledger sync failed, will retry");
                    } else if attempts >= MAX_REJECTED_ATTEMPTS {
                        match self.storage.dead_letter_outbox(&entry.key, &e.to_string(), now) {
                            Ok(_) => {
                                tracing::error!(key = %entry.key, attempts, error = %e, "Ledger keeps rejecting entry, moved to dead letters");
                                report.dead_lettered += 1;
                            }
                            Err(e2) => {
                                tracing::error!(key = %entry.key, error = %e2, "Failed to dead-letter outbox entry");
                                report.failed += 1;
                            }
                        }
                        continue;
                    } else {
                        tracing::error!(key = %entry.key, attempts, error = %e, "Ledger sync rejected, will retry");
                    }
                    if let Err(e2) = self.storage.mark_outbox_failed(&entry.key, &e.to_string(), now) {
                        tracing::error!(key = %entry.key, error = %e2, "Failed to record outbox failure");
                    }
                    report.failed += 1;
                }
            }
        }

        if report.delivered + report.failed + report.dead_lettered > 0 {
            tracing::debug!(?report, "Outbox drain pass finished");
        }
        report
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout),
        }
    }

    async fn deliver(&self, entry: &OutboxEntry) -> Result<Delivery, LedgerError> {
        match &entry.op {
            SyncOp::AppendOrder => {
                let order = self
                    .storage
                    .get_order(&entry.order_id)
                    .map_err(|e| LedgerError::Transport(format!("local read failed: {e}")))?;
                let Some(order) = order else {
                    return Ok(Delivery::Dropped("order no longer exists"));
                };

                let existing = self
                    .lookup
                    .find_order(self.ledger.as_ref(), &entry.order_id, self.call_timeout)
                    .await?;
                if existing.is_some() {
                    tracing::debug!(order_id = %entry.order_id, "Order already present in ledger, skipping append");
                    return Ok(Delivery::Done);
                }

                let row = LedgerOrderRow::from_snapshot(&order);
                self.call(self.ledger.append_order(&row)).await?;
                self.lookup.remember(row);
                Ok(Delivery::Done)
            }
            SyncOp::CommitStatus { status } => {
                let order = self
                    .storage
                    .get_order(&entry.order_id)
                    .map_err(|e| LedgerError::Transport(format!("local read failed: {e}")))?;
                if order.is_some_and(|o| o.confirmed_at.is_none()) {
                    return Ok(Delivery::Dropped("order was never appended"));
                }

                let append_key = OutboxKind::Append.key(&entry.order_id);
                let append_pending = self
                    .storage
                    .has_outbox_entry(&append_key)
                    .map_err(|e| LedgerError::Transport(format!("local read failed: {e}")))?;
                if append_pending {
                    return Ok(Delivery::Held);
                }
                self.call(self.ledger.commit_status(&entry.order_id, *status))
                    .await?;
                self.lookup.invalidate(&entry.order_id);
                Ok(Delivery::Done)
            }
            SyncOp::AdjustStock { deltas } => {
                self.call(self.ledger.apply_stock(&entry.key, deltas)).await?;
                Ok(Delivery::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::orders::outbox::StockDelta;
    use shared::models::Sku;
    use shared::order::{OrderSnapshot, OrderStatus};

    fn snapshot(order_id: &str) -> OrderSnapshot {
        serde_json::from_value(serde_json::json!({
            "order_id": order_id,
            "order_number": "ORD-000001",
            "customer_id": "cust-1",
            "items": [],
            "subtotal": 10.0,
            "discount": 0.0,
            "total": 10.0,
            "status": "pending",
            "reservation_expires_at": 0,
            "created_at": 1,
            "updated_at": 1,
            "confirmed_at": 1
        }))
        .unwrap()
    }

    fn setup() -> (OrderStorage, Arc<MemoryLedger>, Arc<CatalogService>, SyncWorker) {
        let storage = OrderStorage::open_in_memory().unwrap();
        let ledger = Arc::new(MemoryLedger::with_catalog([Sku::new("X", "Rose", 20.0, 10)]));
        let catalog = Arc::new(CatalogService::new());
        let worker = SyncWorker::new(
            storage.clone(),
            ledger.clone(),
            catalog.clone(),
            Duration::from_secs(1),
        );
        (storage, ledger, catalog, worker)
    }

    fn enqueue(storage: &OrderStorage, entry: OutboxEntry) {
        let txn = storage.begin_write().unwrap();
        storage.enqueue_outbox(&txn, &entry).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(0), Duration::ZERO);
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(4), Duration::from_secs(40));
        assert_eq!(backoff_delay(20), Duration::from_secs(300));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_append_then_commit() {
        let (storage, ledger, _catalog, worker) = setup();
        let txn = storage.begin_write().unwrap();
        let mut order = snapshot("o1");
        storage.put_order(&txn, &order).unwrap();
        storage.enqueue_outbox(&txn, &OutboxEntry::append("o1", 1)).unwrap();
        order.status = OrderStatus::Delivered;
        storage.put_order(&txn, &order).unwrap();
        storage
            .enqueue_outbox(&txn, &OutboxEntry::commit("o1", OrderStatus::Delivered, 2))
            .unwrap();
        txn.commit().unwrap();

        let report = worker.drain(10).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(ledger.order("o1").unwrap().status, "delivered");
        assert!(storage.get_order("o1").unwrap().unwrap().ledger_committed);
        assert!(storage.get_pending_outbox().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_held_while_append_fails() {
        let (storage, ledger, _catalog, worker) = setup();
        let txn = storage.begin_write().unwrap();
        storage.put_order(&txn, &snapshot("o1")).unwrap();
        storage.enqueue_outbox(&txn, &OutboxEntry::append("o1", 1)).unwrap();
        storage
            .enqueue_outbox(&txn, &OutboxEntry::commit("o1", OrderStatus::Cancelled, 2))
            .unwrap();
        txn.commit().unwrap();

        ledger.set_failing(true);
        let report = worker.drain(10).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.held, 1);

        let append = storage.get_outbox_entry("o1:append").unwrap().unwrap();
        assert_eq!(append.attempts, 1);
        assert!(append.last_error.is_some());
        let commit = storage.get_outbox_entry("o1:commit").unwrap().unwrap();
        assert_eq!(commit.attempts, 0);

        // Not due yet (5s backoff)
        ledger.set_failing(false);
        let report = worker.drain(1_000).await;
        assert_eq!(report.not_due, 1);
        assert_eq!(report.held, 1);

        let report = worker.drain(10 + 5_000).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(ledger.order("o1").unwrap().status, "cancelled");
        assert!(storage.get_order("o1").unwrap().unwrap().ledger_committed);
    }

    #[tokio::test]
    async fn test_append_skipped_when_ledger_has_row() {
        let (storage, ledger, _catalog, worker) = setup();
        let order = snapshot("o1");
        ledger
            .append_order(&LedgerOrderRow::from_snapshot(&order))
            .await
            .unwrap();
        let txn = storage.begin_write().unwrap();
        storage.put_order(&txn, &order).unwrap();
        storage.enqueue_outbox(&txn, &OutboxEntry::append("o1", 1)).unwrap();
        txn.commit().unwrap();

        let report = worker.drain(10).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(ledger.append_calls(), 1);
    }

    #[tokio::test]
    async fn test_stock_ack_bumps_epoch_once() {
        let (storage, ledger, catalog, worker) = setup();
        enqueue(
            &storage,
            OutboxEntry::stock(
                "o1",
                OutboxKind::Stock,
                vec![StockDelta { sku: "X".into(), delta: -2 }],
                1,
            ),
        );
        let before = catalog.stock_sync_epoch();
        let report = worker.drain(10).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(catalog.stock_sync_epoch(), before + 1);
        assert_eq!(ledger.on_hand("X"), Some(8));
        assert!(storage.pending_stock_deltas().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_for_purged_order_dropped() {
        let (storage, ledger, _catalog, worker) = setup();
        enqueue(&storage, OutboxEntry::append("gone", 1));
        let report = worker.drain(10).await;
        assert_eq!(report.dropped, 1);
        assert_eq!(ledger.append_calls(), 0);
        assert!(storage.get_pending_outbox().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_for_unconfirmed_order_discarded() {
        let (storage, ledger, _catalog, worker) = setup();
        let mut order = snapshot("o1");
        order.confirmed_at = None;
        order.status = OrderStatus::Expired;
        let txn = storage.begin_write().unwrap();
        storage.put_order(&txn, &order).unwrap();
        storage
            .enqueue_outbox(&txn, &OutboxEntry::commit("o1", OrderStatus::Expired, 1))
            .unwrap();
        txn.commit().unwrap();

        let report = worker.drain(10).await;
        assert_eq!(report.dropped, 1);
        assert_eq!(report.failed, 0);
        assert!(ledger.order("o1").is_none());
        assert!(storage.get_pending_outbox().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_commit_dead_lettered_after_cap() {
        let (storage, _ledger, _catalog, worker) = setup();
        // Confirmed locally, but the ledger never got the row
        let txn = storage.begin_write().unwrap();
        storage.put_order(&txn, &snapshot("o1")).unwrap();
        storage
            .enqueue_outbox(&txn, &OutboxEntry::commit("o1", OrderStatus::Cancelled, 1))
            .unwrap();
        txn.commit().unwrap();

        let step = 400_000;
        for pass in 1..MAX_REJECTED_ATTEMPTS {
            let report = worker.drain(i64::from(pass) * step).await;
            assert_eq!(report.failed, 1);
            let entry = storage.get_outbox_entry("o1:commit").unwrap().unwrap();
            assert_eq!(entry.attempts, pass);
        }

        let report = worker.drain(i64::from(MAX_REJECTED_ATTEMPTS) * step).await;
        assert_eq!(report.dead_lettered, 1);
        assert!(storage.get_pending_outbox().unwrap().is_empty());

        let dead = storage.get_dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].key, "o1:commit");
        assert_eq!(dead[0].attempts, MAX_REJECTED_ATTEMPTS);
        assert!(dead[0].last_error.as_deref().unwrap().contains("404"));
        assert!(!storage.get_order("o1").unwrap().unwrap().ledger_committed);

        // Later passes leave it alone
        let report = worker.drain(100 * step).await;
        assert_eq!(report, DrainReport::default());
    }

    #[tokio::test]
    async fn test_transient_failures_never_dead_lettered() {
        let (storage, ledger, _catalog, worker) = setup();
        enqueue(
            &storage,
            OutboxEntry::stock(
                "o1",
                OutboxKind::Stock,
                vec![StockDelta { sku: "X".into(), delta: -1 }],
                1,
            ),
        );
        ledger.set_failing(true);
        for pass in 1..=(MAX_REJECTED_ATTEMPTS + 2) {
            let report = worker.drain(i64::from(pass) * 400_000).await;
            assert_eq!(report.failed, 1);
        }
        assert!(storage.get_dead_letters().unwrap().is_empty());
        let entry = storage.get_outbox_entry("o1:stock").unwrap().unwrap();
        assert_eq!(entry.attempts, MAX_REJECTED_ATTEMPTS + 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_storage, _ledger, _catalog, worker) = setup();
        let (_tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(rx, shutdown.clone()));
        shutdown.cancel();
        let joined = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(joined.is_ok());
    }
}
