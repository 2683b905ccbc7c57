//! Order snapshot and status

use super::types::{
    ContactDetails, DeductedLine, DeliveryMethod, DeliverySlot, LineItem, PaymentRecord,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order status
///
/// ```text
/// buffer → pending → courier_assigned → delivered
///    └──────┴──────────────┴──→ cancelled | expired | not_issued
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, stock reserved, waiting for confirmation
    #[default]
    Buffer,
    Pending,
    CourierAssigned,
    Delivered,
    Cancelled,
    Expired,
    NotIssued,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::NotIssued
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Buffer => "buffer",
            OrderStatus::Pending => "pending",
            OrderStatus::CourierAssigned => "courier_assigned",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
            OrderStatus::NotIssued => "not_issued",
        }
    }

    /// Map an external status string onto the closed enumeration
    ///
    /// Only boundary adapters call this. Legacy aliases: `paid` and
    /// `confirmed` are `pending`, `assigned` is `courier_assigned`,
    /// `completed` is `delivered`.
    pub fn normalize(raw: &str) -> Option<OrderStatus> {
        let key = raw.trim().to_lowercase().replace([' ', '-'], "_");
        let status = match key.as_str() {
            "buffer" | "new" | "draft" => OrderStatus::Buffer,
            "pending" | "paid" | "confirmed" => OrderStatus::Pending,
            "courier_assigned" | "assigned" | "in_delivery" => OrderStatus::CourierAssigned,
            "delivered" | "completed" | "done" => OrderStatus::Delivered,
            "cancelled" | "canceled" => OrderStatus::Cancelled,
            "expired" => OrderStatus::Expired,
            "not_issued" | "notissued" | "undelivered" => OrderStatus::NotIssued,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order snapshot - the persisted order record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSnapshot {
    pub order_id: String,
    /// Human-readable order number
    pub order_number: String,
    pub customer_id: String,
    pub items: Vec<LineItem>,

    // === Totals ===
    pub subtotal: f64,
    pub discount: f64,
    pub total: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promo_code: Option<String>,

    pub status: OrderStatus,
    /// Absolute expiry of this order's reservations
    pub reservation_expires_at: i64,

    // === Delivery ===
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_method: Option<DeliveryMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub courier_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_slot: Option<DeliverySlot>,

    // === Payment / stock ===
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentRecord>,
    /// Stock deducted so far (returned on not_issued / cancel)
    #[serde(default)]
    pub deducted: Vec<DeductedLine>,
    /// External ledger acknowledged the terminal commit
    #[serde(default)]
    pub ledger_committed: bool,

    // === Timestamps ===
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_issued_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_issued_reason: Option<String>,
}

impl OrderSnapshot {
    pub fn is_paid(&self) -> bool {
        self.payment.is_some()
    }

    pub fn has_delivery_method(&self) -> bool {
        self.delivery_method.is_some()
    }

    pub fn is_stock_deducted(&self) -> bool {
        !self.deducted.is_empty()
    }

    /// Slot key currently held by this order, if any
    pub fn slot_key(&self) -> Option<String> {
        match (&self.courier_id, &self.delivery_slot) {
            (Some(courier), Some(slot)) => Some(slot.key_for(courier)),
            _ => None,
        }
    }

    /// Total item quantity per SKU
    pub fn quantities_by_sku(&self) -> Vec<(String, u32)> {
        let mut out: Vec<(String, u32)> = Vec::new();
        for item in &self.items {
            match out.iter_mut().find(|(sku, _)| sku == &item.sku) {
                Some((_, qty)) => *qty += item.quantity,
                None => out.push((item.sku.clone(), item.quantity)),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_aliases() {
        assert_eq!(OrderStatus::normalize("paid"), Some(OrderStatus::Pending));
        assert_eq!(OrderStatus::normalize(" Pending "), Some(OrderStatus::Pending));
        assert_eq!(
            OrderStatus::normalize("Courier Assigned"),
            Some(OrderStatus::CourierAssigned)
        );
        assert_eq!(OrderStatus::normalize("not-issued"), Some(OrderStatus::NotIssued));
        assert_eq!(OrderStatus::normalize("canceled"), Some(OrderStatus::Cancelled));
        assert_eq!(OrderStatus::normalize("shipped?"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!OrderStatus::Buffer.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::CourierAssigned.is_terminal());
        assert!(OrderStatus::Delivered.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(OrderStatus::NotIssued.is_terminal());
    }

    #[test]
    fn test_status_roundtrips_as_str() {
        for status in [
            OrderStatus::Buffer,
            OrderStatus::CourierAssigned,
            OrderStatus::NotIssued,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(OrderStatus::normalize(status.as_str()), Some(status));
        }
    }
}
