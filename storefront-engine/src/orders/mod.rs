//! Order lifecycle module
//!
//! - **manager**: OrdersManager, the state machine and its side effects
//! - **storage**: redb persistence for orders, holds, slots, outbox, wallets
//! - **outbox**: pending external ledger writes
//! - **expiry_worker**: periodic sweeps (hold expiry, stale pending, purge)
//! - **money**: decimal helpers for totals, bonus and cashback
//!
//! # Architecture
//!
//! ```text
//! Operation → OrdersManager → redb txn (order + holds + outbox + history)
//!                  ↓                         ↓
//!              Broadcast               SyncWorker → External ledger
//! ```

pub mod expiry_worker;
pub mod manager;
pub mod money;
pub mod outbox;
pub mod storage;

pub use expiry_worker::{ExpiryWorker, SweepSettings};
pub use manager::{
    CreateOrderOutcome, ManagerConfig, ManagerError, ManagerResult, OrdersManager,
    PaymentOutcome,
};
pub use outbox::{OutboxEntry, OutboxKind, StockDelta, SyncOp};
pub use storage::{BonusWallet, OrderStorage, StorageError};
