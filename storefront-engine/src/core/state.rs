use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::config::Config;
use super::error::Result;
use super::tasks::{BackgroundTasks, TaskKind};
use crate::ledger::{ExternalLedger, HttpLedger, MemoryLedger, SyncWorker};
use crate::orders::{ExpiryWorker, OrderStorage, OrdersManager};
use crate::services::{CatalogService, LogNotifier, StaticCourierDirectory, parse_roster};

/// Outbox wake-up channel capacity (the periodic scan covers overflow)
const OUTBOX_CHANNEL_CAPACITY: usize = 1024;

/// 引擎状态 - 持有所有服务的共享引用
///
/// | 字段 | 说明 |
/// |------|------|
/// | config | 配置项 (不可变) |
/// | storage | redb 本地存储 |
/// | catalog | 商品快照 |
/// | ledger | 外部账本 |
/// | couriers | 快递员名册 |
/// | orders_manager | 订单状态机 |
#[derive(Clone)]
pub struct EngineState {
    pub config: Config,
    pub storage: OrderStorage,
    pub catalog: Arc<CatalogService>,
    pub ledger: Arc<dyn ExternalLedger>,
    pub couriers: Arc<StaticCourierDirectory>,
    pub orders_manager: Arc<OrdersManager>,
    /// Taken by the sync worker when background tasks start
    outbox_rx: Arc<Mutex<Option<mpsc::Receiver<String>>>>,
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("config", &self.config)
            .field("catalog", &self.catalog)
            .finish()
    }
}

impl EngineState {
    /// 初始化引擎状态
    ///
    /// Opens the redb file under the work dir, selects the ledger adapter
    /// (HTTP when `LEDGER_URL` is set, in-memory otherwise) and wires the
    /// manager to the sync worker channel.
    pub async fn initialize(config: &Config) -> Result<Self> {
        let db_path = config.db_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let storage = OrderStorage::open(&db_path)?;
        tracing::info!(path = %db_path.display(), "Order storage opened");

        let ledger: Arc<dyn ExternalLedger> = match &config.ledger_url {
            Some(url) => {
                tracing::info!(url = %url, "Using HTTP ledger");
                Arc::new(HttpLedger::new(url.clone(), config.ledger_timeout())?)
            }
            None => {
                tracing::warn!("LEDGER_URL not set, using in-memory ledger");
                Arc::new(MemoryLedger::new())
            }
        };

        let roster = parse_roster(&config.couriers);
        tracing::info!(count = roster.len(), "Courier roster loaded");
        let couriers = Arc::new(StaticCourierDirectory::with_couriers(roster));

        let catalog = Arc::new(CatalogService::new());
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CHANNEL_CAPACITY);
        let mut manager = OrdersManager::new(
            storage.clone(),
            catalog.clone(),
            couriers.clone(),
            Arc::new(LogNotifier),
            config.manager_config(),
        )
        .with_pricing(config.pricing_policy());
        manager.set_outbox_notifier(outbox_tx);

        Ok(Self {
            config: config.clone(),
            storage,
            catalog,
            ledger,
            couriers,
            orders_manager: Arc::new(manager),
            outbox_rx: Arc::new(Mutex::new(Some(outbox_rx))),
        })
    }

    /// Initial catalog load; failure leaves an empty (degraded) snapshot
    pub async fn warmup(&self) {
        match self
            .catalog
            .refresh(
                self.ledger.as_ref(),
                &self.storage,
                self.config.ledger_timeout(),
            )
            .await
        {
            Ok(report) => tracing::info!(sku_count = report.sku_count, "Catalog warmed up"),
            Err(e) => tracing::error!(error = %e, "Initial catalog load failed, starting degraded"),
        }
    }

    /// 启动后台任务 (sync worker + expiry worker)
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let mut tasks = BackgroundTasks::new();

        match self.outbox_rx.lock().take() {
            Some(rx) => {
                let worker = SyncWorker::new(
                    self.storage.clone(),
                    self.ledger.clone(),
                    self.catalog.clone(),
                    self.config.ledger_timeout(),
                )
                .with_scan_interval(self.config.outbox_scan_interval());
                let token = tasks.shutdown_token();
                tasks.spawn("sync_worker", TaskKind::Worker, worker.run(rx, token));
            }
            None => tracing::warn!("Sync worker already started"),
        }

        let expiry = ExpiryWorker::new(
            self.orders_manager.clone(),
            self.ledger.clone(),
            self.config.sweep_settings(),
        );
        let token = tasks.shutdown_token();
        tasks.spawn("expiry_worker", TaskKind::Periodic, expiry.run(token));

        tasks.log_summary();
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::order::ItemInput;

    #[tokio::test]
    async fn test_initialize_with_memory_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_work_dir(dir.path().join("engine").to_string_lossy());

        let state = EngineState::initialize(&config).await.unwrap();
        state.warmup().await;
        assert!(state.catalog.is_empty());
        assert!(config.db_path().exists());

        let tasks = state.start_background_tasks();
        assert_eq!(tasks.len(), 2);
        // The receiver can only be taken once
        assert_eq!(state.start_background_tasks().len(), 1);

        let err = state
            .orders_manager
            .create_order("cust-1", vec![ItemInput::new("X", 1)], None, None)
            .unwrap_err();
        assert!(matches!(err, crate::orders::ManagerError::UnknownSku(_)));

        tasks.shutdown(std::time::Duration::from_secs(1)).await;
    }
}
