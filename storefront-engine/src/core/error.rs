use crate::ledger::LedgerError;
use crate::orders::storage::StorageError;
use thiserror::Error;

/// Startup / wiring errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("存储初始化失败: {0}")]
    Storage(#[from] StorageError),

    #[error("外部账本配置错误: {0}")]
    Ledger(#[from] LedgerError),

    #[error("工作目录不可用: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
