//! 服务层 - 引擎协作服务
//!
//! # 服务列表
//!
//! - [`CatalogService`] - SKU 快照缓存（从外部账本刷新）
//! - [`CourierDirectory`] - 快递员名册
//! - [`Notifier`] - 尽力而为的通知发送

pub mod catalog_service;
pub mod courier;
pub mod notifier;

pub use catalog_service::{CatalogService, RefreshReport};
pub use courier::{CourierDirectory, StaticCourierDirectory, parse_roster};
pub use notifier::{LogNotifier, Notifier, NotifyOutcome, RecordingNotifier};
