//! Storefront Engine - 库存预留与订单生命周期引擎
//!
//! # 架构概述
//!
//! - **订单** (`orders`): 状态机、库存预留、支付副作用、redb 持久化
//! - **库存** (`inventory`): 按 SKU 串行化的在库量变更
//! - **定价** (`pricing`): 批量价与促销码
//! - **外部账本** (`ledger`): 同步队列 (outbox) 与账本适配器
//! - **服务** (`services`): 商品快照、快递员名册、通知
//!
//! # 模块结构
//!
//! ```text
//! storefront-engine/src/
//! ├── core/          # 配置、状态、后台任务
//! ├── orders/        # 订单管理器、存储、过期清扫
//! ├── inventory/     # SKU 串行器、库存变更
//! ├── pricing/       # 订单定价
//! ├── ledger/        # 外部账本、同步 worker
//! ├── services/      # 商品、快递员、通知
//! └── utils/         # 日志
//! ```

pub mod core;
pub mod inventory;
pub mod ledger;
pub mod orders;
pub mod pricing;
pub mod services;
pub mod utils;

// Re-export 公共类型
pub use core::{BackgroundTasks, Config, EngineError, EngineState};
pub use ledger::{ExternalLedger, HttpLedger, MemoryLedger, SyncWorker};
pub use orders::{ManagerError, OrderStorage, OrdersManager};
pub use services::{CatalogService, CourierDirectory, Notifier};

// Re-export unified error types from shared
pub use shared::{AppError, ErrorCategory, ErrorCode};

pub use utils::logger::{init_logger, init_logger_with_file};

pub fn print_banner() {
    println!(
        r#"
  ___ _                __              _
 / __| |_ ___ _ _ ___ / _|_ _ ___ _ _| |_
 \__ \  _/ _ \ '_/ -_)  _| '_/ _ \ ' \  _|
 |___/\__\___/_| \___|_| |_| \___/_||_\__|
    "#
    );
}
