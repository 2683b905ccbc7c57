//! On-hand stock mutations
//!
//! Every deduction or return goes through a [`StockLease`]: the catalog
//! refresh gate (shared) plus the sequencer guards of all touched SKUs.

use super::sequencer::{SkuGuard, SkuSequencer};
use crate::orders::outbox::StockDelta;
use crate::services::CatalogService;
use shared::order::DeductedLine;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OwnedRwLockReadGuard;

/// Stock integrity errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StockError {
    #[error("Stock for {sku} would become negative (on_hand={on_hand}, delta={delta})")]
    NegativeStock { sku: String, on_hand: i64, delta: i64 },

    #[error("Unknown SKU: {0}")]
    UnknownSku(String),
}

/// Result of deducting a set of lines
#[derive(Debug, Default)]
pub struct DeductOutcome {
    pub applied: Vec<DeductedLine>,
    pub refused: Vec<StockError>,
}

impl DeductOutcome {
    /// Outbox deltas for the applied part
    pub fn deltas(&self) -> Vec<StockDelta> {
        self.applied
            .iter()
            .map(|line| StockDelta {
                sku: line.sku.clone(),
                delta: -i64::from(line.quantity),
            })
            .collect()
    }
}

/// Entry point for stock mutations
#[derive(Debug, Clone)]
pub struct StockKeeper {
    catalog: Arc<CatalogService>,
    sequencer: Arc<SkuSequencer>,
}

impl StockKeeper {
    pub fn new(catalog: Arc<CatalogService>, sequencer: Arc<SkuSequencer>) -> Self {
        Self { catalog, sequencer }
    }

    pub fn sequencer(&self) -> &Arc<SkuSequencer> {
        &self.sequencer
    }

    /// Take exclusive mutation rights on the given SKUs
    pub async fn lease<'a, I>(&self, skus: I) -> StockLease
    where
        I: IntoIterator<Item = &'a str>,
    {
        let gate = self.catalog.stock_gate().await;
        let guards = self.sequencer.acquire_many(skus).await;
        StockLease {
            catalog: self.catalog.clone(),
            _gate: gate,
            _guards: guards,
        }
    }
}

/// Mutation rights on a set of SKUs, released on drop
pub struct StockLease {
    catalog: Arc<CatalogService>,
    _gate: OwnedRwLockReadGuard<()>,
    _guards: Vec<SkuGuard>,
}

impl StockLease {
    /// Deduct each line from on-hand
    ///
    /// Lines that would drive stock negative are refused and logged; the rest
    /// are applied.
    pub fn deduct(&self, order_id: &str, lines: &[(String, u32)]) -> DeductOutcome {
        let mut outcome = DeductOutcome::default();
        for (sku, quantity) in lines {
            match self.catalog.apply_delta(sku, -i64::from(*quantity)) {
                Ok(remaining) => {
                    tracing::debug!(order_id = %order_id, sku = %sku, quantity, remaining, "Stock deducted");
                    outcome.applied.push(DeductedLine {
                        sku: sku.clone(),
                        quantity: *quantity,
                    });
                }
                Err(e) => {
                    tracing::error!(order_id = %order_id, sku = %sku, quantity, error = %e, "Stock deduction refused");
                    outcome.refused.push(e);
                }
            }
        }
        outcome
    }

    /// Undo deductions whose transaction failed to commit
    pub fn revert(&self, order_id: &str, applied: &[DeductedLine]) {
        for line in applied {
            if let Err(e) = self.catalog.apply_delta(&line.sku, i64::from(line.quantity)) {
                tracing::error!(order_id = %order_id, sku = %line.sku, error = %e, "Failed to revert stock deduction");
            }
        }
    }

    /// Return previously deducted stock
    pub fn restock(&self, order_id: &str, lines: &[DeductedLine]) {
        for line in lines {
            match self.catalog.apply_delta(&line.sku, i64::from(line.quantity)) {
                Ok(on_hand) => {
                    tracing::debug!(order_id = %order_id, sku = %line.sku, quantity = line.quantity, on_hand, "Stock returned");
                }
                Err(e) => {
                    tracing::error!(order_id = %order_id, sku = %line.sku, error = %e, "Failed to return stock");
                }
            }
        }
    }
}

/// Outbox deltas for returning deducted lines
pub fn return_deltas(lines: &[DeductedLine]) -> Vec<StockDelta> {
    lines
        .iter()
        .map(|line| StockDelta {
            sku: line.sku.clone(),
            delta: i64::from(line.quantity),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::models::Sku;
    use std::time::Duration;

    fn keeper(skus: Vec<Sku>) -> (StockKeeper, Arc<CatalogService>) {
        let catalog = Arc::new(CatalogService::with_skus(skus));
        let keeper = StockKeeper::new(catalog.clone(), Arc::new(SkuSequencer::new()));
        (keeper, catalog)
    }

    #[tokio::test]
    async fn test_deduct_partial_refusal() {
        let (keeper, catalog) = keeper(vec![
            Sku::new("X", "Rose", 20.0, 5),
            Sku::new("Y", "Tulip", 10.0, 1),
        ]);
        let lease = keeper.lease(["X", "Y"]).await;
        let outcome = lease.deduct("o1", &[("X".to_string(), 2), ("Y".to_string(), 3)]);

        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.applied[0].sku, "X");
        assert_eq!(outcome.refused.len(), 1);
        assert_eq!(catalog.on_hand("X"), Some(3));
        assert_eq!(catalog.on_hand("Y"), Some(1));
        assert_eq!(outcome.deltas()[0].delta, -2);
    }

    #[tokio::test]
    async fn test_revert_and_restock() {
        let (keeper, catalog) = keeper(vec![Sku::new("X", "Rose", 20.0, 5)]);
        let lease = keeper.lease(["X"]).await;
        let outcome = lease.deduct("o1", &[("X".to_string(), 5)]);
        assert_eq!(catalog.on_hand("X"), Some(0));
        lease.revert("o1", &outcome.applied);
        assert_eq!(catalog.on_hand("X"), Some(5));
        lease.restock("o1", &[DeductedLine { sku: "X".into(), quantity: 2 }]);
        assert_eq!(catalog.on_hand("X"), Some(7));
    }

    #[tokio::test]
    async fn test_lease_blocks_same_sku() {
        let (keeper, _catalog) = keeper(vec![Sku::new("X", "Rose", 20.0, 5)]);
        let lease = keeper.lease(["X"]).await;
        let second = tokio::time::timeout(Duration::from_millis(50), keeper.lease(["X"])).await;
        assert!(second.is_err());
        drop(lease);
        let third = tokio::time::timeout(Duration::from_millis(50), keeper.lease(["X"])).await;
        assert!(third.is_ok());
    }

    #[test]
    fn test_return_deltas_positive() {
        let deltas = return_deltas(&[DeductedLine { sku: "X".into(), quantity: 2 }]);
        assert_eq!(deltas, vec![StockDelta { sku: "X".into(), delta: 2 }]);
    }
}
