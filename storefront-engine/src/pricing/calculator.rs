//! Order Price Calculator
//!
//! Volume rule, promo percentage and totals. Uses rust_decimal for precise
//! calculations, stores as f64.
//!
//! ```text
//! line original   = unit_price × qty
//! line subtotal   = applied_unit_price × qty      (bulk price when qty ≥ threshold)
//! subtotal        = Σ line original
//! qty discount    = Σ (line original − line subtotal)
//! promo discount  = (subtotal − qty discount) × promo% / 100
//! discount        = qty discount + promo discount
//! total           = subtotal − discount
//! ```

use crate::orders::money::{percent_of, round2, to_decimal, to_f64};
use rust_decimal::prelude::*;
use shared::models::Sku;
use shared::order::{ItemInput, LineItem};
use std::collections::HashMap;

/// Default quantity from which the bulk price applies
pub const DEFAULT_BULK_THRESHOLD: u32 = 3;

/// Pricing configuration: volume threshold and promo table
#[derive(Debug, Clone)]
pub struct PricingPolicy {
    bulk_threshold: u32,
    /// Upper-cased code -> percentage
    promo_codes: HashMap<String, Decimal>,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BULK_THRESHOLD)
    }
}

impl PricingPolicy {
    pub fn new(bulk_threshold: u32) -> Self {
        Self {
            bulk_threshold: bulk_threshold.max(1),
            promo_codes: HashMap::new(),
        }
    }

    pub fn with_promo(mut self, code: &str, percent: f64) -> Self {
        self.add_promo(code, percent);
        self
    }

    /// Register a promo code; percentages are clamped to [0, 100]
    pub fn add_promo(&mut self, code: &str, percent: f64) {
        let pct = to_decimal(percent).clamp(Decimal::ZERO, Decimal::ONE_HUNDRED);
        self.promo_codes.insert(code.trim().to_uppercase(), pct);
    }

    pub fn bulk_threshold(&self) -> u32 {
        self.bulk_threshold
    }

    /// Case-insensitive promo lookup
    pub fn promo_percent(&self, code: &str) -> Option<Decimal> {
        self.promo_codes.get(&code.trim().to_uppercase()).copied()
    }
}

/// Priced order before persistence
#[derive(Debug, Clone, PartialEq)]
pub struct PricedOrder {
    pub items: Vec<LineItem>,
    pub subtotal: f64,
    pub quantity_discount: f64,
    pub promo_discount: f64,
    pub discount: f64,
    pub total: f64,
    /// Normalized (upper-cased) code that was applied
    pub promo_code: Option<String>,
}

/// Pricing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PricingError {
    #[error("Unknown promo code: {0}")]
    UnknownPromoCode(String),
}

/// Price validated lines against their catalog SKUs
pub fn price_order(
    lines: &[(ItemInput, Sku)],
    policy: &PricingPolicy,
    promo_code: Option<&str>,
) -> Result<PricedOrder, PricingError> {
    let promo = match promo_code.map(str::trim).filter(|c| !c.is_empty()) {
        Some(code) => {
            let pct = policy
                .promo_percent(code)
                .ok_or_else(|| PricingError::UnknownPromoCode(code.to_string()))?;
            Some((code.to_uppercase(), pct))
        }
        None => None,
    };

    let mut items = Vec::with_capacity(lines.len());
    let mut subtotal = Decimal::ZERO;
    let mut quantity_discount = Decimal::ZERO;

    for (input, sku) in lines {
        let qty = Decimal::from(input.quantity);
        let unit = round2(to_decimal(sku.unit_price));
        let applied_unit = match sku.bulk_price {
            Some(bulk) if input.quantity >= policy.bulk_threshold => {
                round2(to_decimal(bulk)).min(unit)
            }
            _ => unit,
        };

        let original = round2(unit * qty);
        let line_subtotal = round2(applied_unit * qty);
        subtotal += original;
        quantity_discount += original - line_subtotal;

        items.push(LineItem {
            sku: sku.id.clone(),
            name: sku.name.clone(),
            quantity: input.quantity,
            unit_price: to_f64(unit),
            applied_unit_price: to_f64(applied_unit),
            line_subtotal: to_f64(line_subtotal),
            is_upsell: input.is_upsell,
        });
    }

    let after_quantity = subtotal - quantity_discount;
    let promo_discount = match &promo {
        Some((_, pct)) => percent_of(after_quantity, *pct),
        None => Decimal::ZERO,
    };
    let discount = quantity_discount + promo_discount;
    let total = subtotal - discount;

    Ok(PricedOrder {
        items,
        subtotal: to_f64(subtotal),
        quantity_discount: to_f64(quantity_discount),
        promo_discount: to_f64(promo_discount),
        discount: to_f64(discount),
        total: to_f64(total),
        promo_code: promo.map(|(code, _)| code),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn line(sku: Sku, qty: u32) -> (ItemInput, Sku) {
        (ItemInput::new(sku.id.clone(), qty), sku)
    }

    #[test]
    fn test_below_bulk_threshold() {
        let sku = Sku::new("X", "Rose", 20.0, 10).with_bulk_price(15.0);
        let priced = price_order(&[line(sku, 2)], &PricingPolicy::default(), None).unwrap();
        assert_eq!(priced.total, 40.0);
        assert_eq!(priced.discount, 0.0);
        assert_eq!(priced.items[0].applied_unit_price, 20.0);
    }

    #[test]
    fn test_bulk_threshold_reached() {
        let sku = Sku::new("X", "Rose", 20.0, 10).with_bulk_price(15.0);
        let priced = price_order(&[line(sku, 3)], &PricingPolicy::default(), None).unwrap();
        assert_eq!(priced.subtotal, 60.0);
        assert_eq!(priced.total, 45.0);
        assert_eq!(priced.discount, 15.0);
        assert_eq!(priced.items[0].line_subtotal, 45.0);
    }

    #[test]
    fn test_promo_applies_after_volume_discount() {
        let policy = PricingPolicy::default().with_promo("spring10", 10.0);
        let rose = Sku::new("X", "Rose", 20.0, 10).with_bulk_price(15.0);
        let vase = Sku::new("V", "Vase", 9.99, 10);
        let priced =
            price_order(&[line(rose, 3), line(vase, 1)], &policy, Some(" Spring10 ")).unwrap();
        // subtotal 69.99, qty discount 15, promo 10% of 54.99 = 5.50
        assert_eq!(priced.subtotal, 69.99);
        assert_eq!(priced.quantity_discount, 15.0);
        assert_eq!(priced.promo_discount, 5.5);
        assert_eq!(priced.discount, 20.5);
        assert_eq!(priced.total, 49.49);
        assert_eq!(priced.promo_code.as_deref(), Some("SPRING10"));
    }

    #[test]
    fn test_unknown_promo_rejected() {
        let sku = Sku::new("X", "Rose", 20.0, 10);
        let err = price_order(&[line(sku, 1)], &PricingPolicy::default(), Some("NOPE")).unwrap_err();
        assert_eq!(err, PricingError::UnknownPromoCode("NOPE".into()));
    }

    #[test]
    fn test_bulk_price_above_unit_is_ignored() {
        let sku = Sku::new("X", "Rose", 20.0, 10).with_bulk_price(25.0);
        let priced = price_order(&[line(sku, 5)], &PricingPolicy::default(), None).unwrap();
        assert_eq!(priced.total, 100.0);
        assert_eq!(priced.discount, 0.0);
    }

    #[test]
    fn test_subtotal_minus_discount_is_total_randomized() {
        let mut rng = rand::thread_rng();
        let policy = PricingPolicy::default()
            .with_promo("A", 7.5)
            .with_promo("B", 33.0);
        for _ in 0..500 {
            let n = rng.gen_range(1..5);
            let lines: Vec<(ItemInput, Sku)> = (0..n)
                .map(|i| {
                    let cents: u32 = rng.gen_range(1..100_000);
                    let mut sku = Sku::new(format!("S{}", i), "Item", f64::from(cents) / 100.0, 100);
                    if rng.gen_bool(0.5) {
                        sku = sku.with_bulk_price(f64::from(cents) / 100.0 * 0.8);
                    }
                    line(sku, rng.gen_range(1..10))
                })
                .collect();
            let promo = match rng.gen_range(0..3) {
                0 => None,
                1 => Some("A"),
                _ => Some("B"),
            };
            let priced = price_order(&lines, &policy, promo).unwrap();
            let lhs = to_decimal(priced.subtotal) - to_decimal(priced.discount);
            assert_eq!(round2(lhs), round2(to_decimal(priced.total)));
            assert!(priced.total >= 0.0);
        }
    }
}
