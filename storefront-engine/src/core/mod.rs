//! 核心模块 - 引擎配置、状态、后台任务和错误定义
//!
//! - [`Config`] - 引擎配置
//! - [`EngineState`] - 引擎状态
//! - [`BackgroundTasks`] - 后台任务管理
//! - [`EngineError`] - 启动错误

pub mod config;
pub mod error;
pub mod state;
pub mod tasks;

pub use config::Config;
pub use error::{EngineError, Result};
pub use state::EngineState;
pub use tasks::{BackgroundTasks, TaskKind};
