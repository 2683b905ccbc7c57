//! Transactional outbox rows
//!
//! Entries are written in the same redb transaction as the order change that
//! requires them and drained by [`crate::ledger::SyncWorker`]. Keys are
//! deterministic, so enqueueing the same change twice is a no-op.

use serde::{Deserialize, Serialize};
use shared::order::OrderStatus;

/// Signed on-hand change for one SKU
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StockDelta {
    pub sku: String,
    pub delta: i64,
}

/// Outbox entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxKind {
    /// Mirror the confirmed order row
    Append,
    /// Mirror the terminal status
    Commit,
    /// Deduction at payment/delivery
    Stock,
    /// Return of previously deducted stock
    StockReturn,
}

impl OutboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxKind::Append => "append",
            OutboxKind::Commit => "commit",
            OutboxKind::Stock => "stock",
            OutboxKind::StockReturn => "stock_return",
        }
    }

    /// `{order_id}:{kind}`
    pub fn key(&self, order_id: &str) -> String {
        format!("{}:{}", order_id, self.as_str())
    }
}

/// Operation carried by an outbox entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncOp {
    /// Payload is read from local storage at delivery time
    AppendOrder,
    CommitStatus { status: OrderStatus },
    AdjustStock { deltas: Vec<StockDelta> },
}

/// Pending external write
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxEntry {
    pub key: String,
    pub order_id: String,
    pub op: SyncOp,
    pub created_at: i64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_attempt_at: Option<i64>,
}

impl OutboxEntry {
    pub fn new(order_id: &str, kind: OutboxKind, op: SyncOp, now: i64) -> Self {
        Self {
            key: kind.key(order_id),
            order_id: order_id.to_string(),
            op,
            created_at: now,
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
        }
    }

    pub fn append(order_id: &str, now: i64) -> Self {
        Self::new(order_id, OutboxKind::Append, SyncOp::AppendOrder, now)
    }

    pub fn commit(order_id: &str, status: OrderStatus, now: i64) -> Self {
        Self::new(
            order_id,
            OutboxKind::Commit,
            SyncOp::CommitStatus { status },
            now,
        )
    }

    pub fn stock(order_id: &str, kind: OutboxKind, deltas: Vec<StockDelta>, now: i64) -> Self {
        Self::new(order_id, kind, SyncOp::AdjustStock { deltas }, now)
    }

    pub fn is_commit(&self) -> bool {
        matches!(self.op, SyncOp::CommitStatus { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_keys() {
        assert_eq!(OutboxKind::Append.key("o1"), "o1:append");
        assert_eq!(OutboxKind::Commit.key("o1"), "o1:commit");
        assert_eq!(OutboxKind::StockReturn.key("o1"), "o1:stock_return");
        let entry = OutboxEntry::commit("o1", OrderStatus::Delivered, 5);
        assert_eq!(entry.key, "o1:commit");
        assert!(entry.is_commit());
    }

    #[test]
    fn test_op_serde_tag() {
        let op = SyncOp::AdjustStock {
            deltas: vec![StockDelta {
                sku: "X".into(),
                delta: -2,
            }],
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "adjust_stock");
        assert_eq!(json["deltas"][0]["delta"], -2);
    }
}
