//! Shared types for the order lifecycle

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Items
// ============================================================================

/// Requested line at order creation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemInput {
    pub sku: String,
    pub quantity: u32,
    /// Added from an upsell suggestion
    #[serde(default)]
    pub is_upsell: bool,
}

impl ItemInput {
    pub fn new(sku: impl Into<String>, quantity: u32) -> Self {
        Self {
            sku: sku.into(),
            quantity,
            is_upsell: false,
        }
    }
}

/// Priced line of an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    /// Catalog unit price at creation
    pub unit_price: f64,
    /// Unit price after the volume rule
    pub applied_unit_price: f64,
    /// quantity × applied_unit_price
    pub line_subtotal: f64,
    #[serde(default)]
    pub is_upsell: bool,
}

/// Stock actually deducted for one SKU of an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeductedLine {
    pub sku: String,
    pub quantity: u32,
}

/// Cart line kept per customer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CartLine {
    pub sku: String,
    pub quantity: u32,
}

// ============================================================================
// Delivery
// ============================================================================

/// 配送方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    /// 快递员配送
    Courier,
    /// 到店自取
    Pickup,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMethod::Courier => "courier",
            DeliveryMethod::Pickup => "pickup",
        }
    }
}

/// Contact details attached on confirmation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContactDetails {
    pub name: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Delivery slot (date + time of day)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DeliverySlot {
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl DeliverySlot {
    pub fn new(date: NaiveDate, time: NaiveTime) -> Self {
        Self { date, time }
    }

    /// Exclusive key for `courier + date + time`
    pub fn key_for(&self, courier_id: &str) -> String {
        format!(
            "{}|{}|{}",
            courier_id,
            self.date.format("%Y-%m-%d"),
            self.time.format("%H:%M")
        )
    }
}

// ============================================================================
// Payment
// ============================================================================

/// 支付方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Cash,
    Transfer,
}

/// Payment outcome stored on the order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRecord {
    pub method: PaymentMethod,
    /// Bonus actually debited from the wallet
    pub bonus_applied: f64,
    /// total − bonus_applied
    pub final_amount: f64,
    /// Credited to the customer's wallet
    pub cashback: f64,
    pub paid_at: i64,
}

// ============================================================================
// Actor
// ============================================================================

/// Who triggers a transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Customer(String),
    Courier(String),
    Admin,
    /// Background sweeper
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Customer(id) => write!(f, "customer:{}", id),
            Actor::Courier(id) => write!(f, "courier:{}", id),
            Actor::Admin => write!(f, "admin"),
            Actor::System => write!(f, "system"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_key() {
        let slot = DeliverySlot::new(
            NaiveDate::from_ymd_opt(2026, 3, 8).unwrap(),
            NaiveTime::from_hms_opt(14, 30, 0).unwrap(),
        );
        assert_eq!(slot.key_for("c7"), "c7|2026-03-08|14:30");
    }

    #[test]
    fn test_actor_serde() {
        let json = serde_json::to_string(&Actor::Courier("c1".into())).unwrap();
        assert_eq!(json, r#"{"kind":"courier","id":"c1"}"#);
        let admin: Actor = serde_json::from_str(r#"{"kind":"admin"}"#).unwrap();
        assert_eq!(admin, Actor::Admin);
    }
}
