//! Expiry Worker - 定时清扫
//!
//! Three independent schedules:
//! - sweep: release expired holds, expire unconfirmed orders, cancel pending
//!   orders past the outer bound
//! - purge: delete old not_issued orders, stale idempotency records, idle
//!   sequencer locks
//! - catalog refresh: reload the SKU snapshot from the external ledger
//!
//! Each step is idempotent; a missed tick is simply caught up by the next one.

use super::manager::OrdersManager;
use crate::ledger::ExternalLedger;
use shared::util::now_millis;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Intervals of the periodic jobs
#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub sweep_interval: Duration,
    pub purge_interval: Duration,
    pub catalog_refresh_interval: Duration,
    /// Per-call timeout of the catalog refresh
    pub ledger_timeout: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            purge_interval: Duration::from_secs(3600),
            catalog_refresh_interval: Duration::from_secs(300),
            ledger_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ExpiryWorker {
    manager: Arc<OrdersManager>,
    ledger: Arc<dyn ExternalLedger>,
    settings: SweepSettings,
}

impl ExpiryWorker {
    pub fn new(
        manager: Arc<OrdersManager>,
        ledger: Arc<dyn ExternalLedger>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            manager,
            ledger,
            settings,
        }
    }

    /// Run until shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            sweep_secs = self.settings.sweep_interval.as_secs(),
            purge_secs = self.settings.purge_interval.as_secs(),
            refresh_secs = self.settings.catalog_refresh_interval.as_secs(),
            "ExpiryWorker started"
        );

        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        let mut purge = tokio::time::interval(self.settings.purge_interval);
        let mut refresh = tokio::time::interval(self.settings.catalog_refresh_interval);
        // The first tick completes immediately; startup already refreshed
        refresh.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("ExpiryWorker received shutdown signal");
                    break;
                }
                _ = sweep.tick() => {
                    self.sweep_once(now_millis()).await;
                }
                _ = purge.tick() => {
                    self.purge_once(now_millis());
                }
                _ = refresh.tick() => {
                    self.refresh_catalog().await;
                }
            }
        }
    }

    /// Expire overdue holds and cancel stale pending orders
    pub async fn sweep_once(&self, now: i64) {
        match self.manager.expire_overdue(now) {
            Ok(expired) if !expired.is_empty() => {
                tracing::info!(count = expired.len(), "Orders expired");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Expiry sweep failed"),
        }
        if let Err(e) = self.manager.cancel_stale_pending(now).await {
            tracing::error!(error = %e, "Stale pending sweep failed");
        }
    }

    /// Purge old records
    pub fn purge_once(&self, now: i64) {
        if let Err(e) = self.manager.purge_not_issued(now) {
            tracing::error!(error = %e, "not_issued purge failed");
        }

        let cutoff = now - self.manager.config().idempotency_ttl_ms;
        match self.manager.storage().purge_idempotency(cutoff) {
            Ok(0) => {}
            Ok(n) => tracing::debug!(count = n, "Purged idempotency records"),
            Err(e) => tracing::error!(error = %e, "Idempotency purge failed"),
        }

        let pruned = self.manager.sequencer().prune();
        if pruned > 0 {
            tracing::debug!(count = pruned, "Pruned idle SKU locks");
        }
    }

    async fn refresh_catalog(&self) {
        // Failures are logged by the catalog and leave the snapshot in place
        if let Ok(report) = self
            .manager
            .catalog()
            .refresh(
                self.ledger.as_ref(),
                self.manager.storage(),
                self.settings.ledger_timeout,
            )
            .await
        {
            tracing::debug!(sku_count = report.sku_count, "Catalog refresh tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::orders::manager::ManagerConfig;
    use crate::orders::storage::OrderStorage;
    use crate::services::{CatalogService, LogNotifier, StaticCourierDirectory};
    use shared::models::Sku;
    use shared::order::{ItemInput, OrderStatus};

    fn setup(config: ManagerConfig) -> (ExpiryWorker, Arc<OrdersManager>, Arc<MemoryLedger>) {
        let skus = vec![Sku::new("X", "Rose", 20.0, 10)];
        let ledger = Arc::new(MemoryLedger::with_catalog(skus.clone()));
        let manager = Arc::new(OrdersManager::new(
            OrderStorage::open_in_memory().unwrap(),
            Arc::new(CatalogService::with_skus(skus)),
            Arc::new(StaticCourierDirectory::new()),
            Arc::new(LogNotifier),
            config,
        ));
        let worker = ExpiryWorker::new(manager.clone(), ledger.clone(), SweepSettings::default());
        (worker, manager, ledger)
    }

    #[tokio::test]
    async fn test_sweep_once_expires_buffer_orders() {
        let config = ManagerConfig {
            reservation_ttl_ms: 1_000,
            ..ManagerConfig::default()
        };
        let (worker, manager, _ledger) = setup(config);
        let outcome = manager
            .create_order("cust-1", vec![ItemInput::new("X", 3)], None, None)
            .unwrap();

        worker.sweep_once(outcome.expires_at + 1).await;

        let order = manager.get_order(&outcome.order_id).unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Expired);
        assert_eq!(manager.get_available_quantity("X").unwrap(), 10);
    }

    #[tokio::test]
    async fn test_purge_once_drops_old_idempotency_records() {
        let (worker, manager, _ledger) = setup(ManagerConfig::default());
        let first = manager
            .create_order("cust-1", vec![ItemInput::new("X", 1)], None, Some("k1"))
            .unwrap();

        worker.purge_once(now_millis() + manager.config().idempotency_ttl_ms + 1);

        let again = manager
            .create_order("cust-1", vec![ItemInput::new("X", 1)], None, Some("k1"))
            .unwrap();
        assert_ne!(first.order_id, again.order_id);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_ledger_stock() {
        let (worker, manager, ledger) = setup(ManagerConfig::default());
        ledger
            .apply_stock("external-sale", &[crate::orders::StockDelta { sku: "X".into(), delta: -6 }])
            .await
            .unwrap();

        worker.refresh_catalog().await;

        assert_eq!(manager.catalog().on_hand("X"), Some(4));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (worker, _manager, _ledger) = setup(ManagerConfig::default());
        let token = CancellationToken::new();
        let handle = tokio::spawn(worker.run(token.clone()));
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
