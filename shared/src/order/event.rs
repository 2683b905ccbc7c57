//! Order history events

use serde::{Deserialize, Serialize};

/// Event types recorded in the order history
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEventType {
    OrderCreated,
    OrderConfirmed,
    CourierAssigned,
    SlotSet,
    PaymentRecorded,
    OrderDelivered,
    OrderCancelled,
    OrderExpired,
    OrderNotIssued,
    LedgerCommitted,
}

impl OrderEventType {
    /// Events that end the order lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderEventType::OrderDelivered
                | OrderEventType::OrderCancelled
                | OrderEventType::OrderExpired
                | OrderEventType::OrderNotIssued
        )
    }
}

/// One entry of the append-only order history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderEvent {
    pub order_id: String,
    /// Per-order sequence, starting at 1
    pub seq: u64,
    pub event_type: OrderEventType,
    pub timestamp: i64,
    /// Display form of the acting party
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
