//! External ledger (system of record) integration
//!
//! - [`ExternalLedger`]: the narrow contract the engine consumes
//! - [`HttpLedger`]: JSON-over-HTTP adapter
//! - [`MemoryLedger`]: in-process mirror (no ledger URL configured, tests)
//! - [`SyncWorker`]: outbox drain task
//!
//! The engine never talks to the ledger on a request path. Writes go through
//! the outbox; reads are the periodic catalog refresh and the worker's
//! existence check before appending an order.

pub mod cache;
pub mod http;
pub mod worker;

pub use cache::LookupCache;
pub use http::HttpLedger;
pub use worker::SyncWorker;

use crate::orders::outbox::StockDelta;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared::models::Sku;
use shared::order::{OrderSnapshot, OrderStatus};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Ledger errors (never surfaced to engine callers)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Ledger request timed out")]
    Timeout,

    #[error("Ledger transport error: {0}")]
    Transport(String),

    #[error("Ledger rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Ledger response could not be decoded: {0}")]
    Decode(String),

    #[error("Ledger unavailable")]
    Unavailable,
}

impl LedgerError {
    /// Transient failures worth retrying soon
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Timeout | LedgerError::Transport(_) | LedgerError::Unavailable => true,
            LedgerError::Rejected { status, .. } => *status >= 500 || *status == 429,
            LedgerError::Decode(_) => false,
        }
    }
}

/// Order row as mirrored in the external ledger
///
/// `status` is the ledger's free-form string; use [`LedgerOrderRow::status`]
/// to read it as an [`OrderStatus`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerOrderRow {
    pub order_id: String,
    pub order_number: String,
    pub customer_id: String,
    pub status: String,
    pub total: f64,
    /// "Rose x3; Vase x1"
    pub items: String,
    #[serde(default)]
    pub delivery_method: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    pub created_at: i64,
}

impl LedgerOrderRow {
    pub fn from_snapshot(order: &OrderSnapshot) -> Self {
        let items = order
            .items
            .iter()
            .map(|i| format!("{} x{}", i.name, i.quantity))
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            order_id: order.order_id.clone(),
            order_number: order.order_number.clone(),
            customer_id: order.customer_id.clone(),
            status: order.status.as_str().to_string(),
            total: order.total,
            items,
            delivery_method: order.delivery_method.map(|m| m.as_str().to_string()),
            contact_phone: order.contact.as_ref().map(|c| c.phone.clone()),
            address: order.contact.as_ref().and_then(|c| c.address.clone()),
            created_at: order.created_at,
        }
    }

    /// Normalized status, `None` for unrecognized strings
    pub fn status(&self) -> Option<OrderStatus> {
        OrderStatus::normalize(&self.status)
    }
}

/// Contract with the external system of record
#[async_trait]
pub trait ExternalLedger: Send + Sync {
    /// Current SKU rows (already mapped to the typed schema)
    async fn fetch_catalog(&self) -> Result<Vec<Sku>, LedgerError>;

    /// Look an order up; `Ok(None)` means the ledger definitely has no row
    async fn find_order(&self, order_id: &str) -> Result<Option<LedgerOrderRow>, LedgerError>;

    async fn append_order(&self, row: &LedgerOrderRow) -> Result<(), LedgerError>;

    async fn commit_status(&self, order_id: &str, status: OrderStatus) -> Result<(), LedgerError>;

    /// Apply stock deltas; `op_id` makes redelivery a no-op
    async fn apply_stock(&self, op_id: &str, deltas: &[StockDelta]) -> Result<(), LedgerError>;
}

// =============================================================================
// MemoryLedger
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    catalog: HashMap<String, Sku>,
    orders: HashMap<String, LedgerOrderRow>,
    applied_ops: HashSet<String>,
    append_calls: u32,
}

/// In-process ledger mirror
///
/// Used when no ledger URL is configured and by tests. Failure injection
/// (`set_failing`) and a fetch delay simulate a slow or broken system of record.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
    failing: AtomicBool,
    fetch_delay_ms: AtomicU64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(skus: impl IntoIterator<Item = Sku>) -> Self {
        let ledger = Self::new();
        {
            let mut state = ledger.state.lock();
            for sku in skus {
                state.catalog.insert(sku.id.clone(), sku);
            }
        }
        ledger
    }

    /// Make every call fail with [`LedgerError::Unavailable`]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.fetch_delay_ms
            .store(delay.as_millis() as u64, Ordering::Release);
    }

    pub fn order(&self, order_id: &str) -> Option<LedgerOrderRow> {
        self.state.lock().orders.get(order_id).cloned()
    }

    pub fn on_hand(&self, sku: &str) -> Option<i64> {
        self.state.lock().catalog.get(sku).map(|s| s.on_hand)
    }

    pub fn append_calls(&self) -> u32 {
        self.state.lock().append_calls
    }

    pub fn applied_stock_ops(&self) -> usize {
        self.state.lock().applied_ops.len()
    }

    fn check(&self) -> Result<(), LedgerError> {
        if self.failing.load(Ordering::Acquire) {
            Err(LedgerError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ExternalLedger for MemoryLedger {
    async fn fetch_catalog(&self) -> Result<Vec<Sku>, LedgerError> {
        let delay = self.fetch_delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check()?;
        let mut skus: Vec<Sku> = self.state.lock().catalog.values().cloned().collect();
        skus.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(skus)
    }

    async fn find_order(&self, order_id: &str) -> Result<Option<LedgerOrderRow>, LedgerError> {
        self.check()?;
        Ok(self.order(order_id))
    }

    async fn append_order(&self, row: &LedgerOrderRow) -> Result<(), LedgerError> {
        self.check()?;
        let mut state = self.state.lock();
        state.append_calls += 1;
        state.orders.insert(row.order_id.clone(), row.clone());
        Ok(())
    }

    async fn commit_status(&self, order_id: &str, status: OrderStatus) -> Result<(), LedgerError> {
        self.check()?;
        let mut state = self.state.lock();
        match state.orders.get_mut(order_id) {
            Some(row) => {
                row.status = status.as_str().to_string();
                Ok(())
            }
            None => Err(LedgerError::Rejected {
                status: 404,
                body: format!("order {} not found", order_id),
            }),
        }
    }

    async fn apply_stock(&self, op_id: &str, deltas: &[StockDelta]) -> Result<(), LedgerError> {
        self.check()?;
        let mut state = self.state.lock();
        if !state.applied_ops.insert(op_id.to_string()) {
            return Ok(());
        }
        for d in deltas {
            if let Some(sku) = state.catalog.get_mut(&d.sku) {
                sku.on_hand = (sku.on_hand + d.delta).max(0);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LedgerError::Timeout.is_retryable());
        assert!(LedgerError::Unavailable.is_retryable());
        assert!(LedgerError::Rejected { status: 503, body: String::new() }.is_retryable());
        assert!(LedgerError::Rejected { status: 429, body: String::new() }.is_retryable());
        assert!(!LedgerError::Rejected { status: 400, body: String::new() }.is_retryable());
        assert!(!LedgerError::Decode("bad".into()).is_retryable());
    }

    #[test]
    fn test_row_status_normalized() {
        let row = LedgerOrderRow {
            order_id: "o1".into(),
            order_number: "ORD-000001".into(),
            customer_id: "c".into(),
            status: "Paid".into(),
            total: 10.0,
            items: String::new(),
            delivery_method: None,
            contact_phone: None,
            address: None,
            created_at: 0,
        };
        assert_eq!(row.status(), Some(OrderStatus::Pending));
    }

    #[tokio::test]
    async fn test_memory_ledger_stock_is_idempotent() {
        let ledger = MemoryLedger::with_catalog([Sku::new("X", "Rose", 20.0, 10)]);
        let deltas = vec![StockDelta { sku: "X".into(), delta: -3 }];
        ledger.apply_stock("o1:stock", &deltas).await.unwrap();
        ledger.apply_stock("o1:stock", &deltas).await.unwrap();
        assert_eq!(ledger.on_hand("X"), Some(7));
        assert_eq!(ledger.applied_stock_ops(), 1);
    }

    #[tokio::test]
    async fn test_memory_ledger_failure_injection() {
        let ledger = MemoryLedger::new();
        ledger.set_failing(true);
        assert_eq!(ledger.find_order("o1").await, Err(LedgerError::Unavailable));
        ledger.set_failing(false);
        assert_eq!(ledger.find_order("o1").await, Ok(None));
    }
}
