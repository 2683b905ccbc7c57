//! Catalog Service - SKU snapshot cache sourced from the external ledger
//!
//! Reservation math reads SKUs through this cache only. The cache is
//! refreshed periodically from [`ExternalLedger::fetch_catalog`]; on failure
//! the stale snapshot stays in place and the service reports itself degraded.
//!
//! # Refresh vs. stock mutations
//!
//! On-hand quantities change locally (deductions, returns) before the external
//! ledger hears about them. A refresh therefore:
//!
//! 1. takes the refresh gate for writing, so no stock mutation is in flight,
//! 2. adds pending (unsynced) outbox stock deltas to the fetched quantities,
//! 3. keeps the local quantities for the whole round if a stock delta was
//!    acknowledged by the ledger while the fetch was running.

use crate::inventory::StockError;
use crate::ledger::{ExternalLedger, LedgerError};
use crate::orders::OrderStorage;
use parking_lot::RwLock;
use shared::models::Sku;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OwnedRwLockReadGuard;

/// Outcome of one refresh round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub sku_count: usize,
    /// Quantities were left untouched this round
    pub quantities_skipped: bool,
}

/// Unified catalog service for SKU lookup and on-hand bookkeeping
#[derive(Clone)]
pub struct CatalogService {
    /// SKU cache: sku id -> Sku
    skus: Arc<RwLock<HashMap<String, Sku>>>,
    /// Held for reading by stock mutations, for writing by refresh
    refresh_gate: Arc<tokio::sync::RwLock<()>>,
    /// Bumped whenever the ledger acknowledges a stock delta
    stock_sync_epoch: Arc<AtomicU64>,
    degraded: Arc<AtomicBool>,
    last_refreshed_at: Arc<AtomicI64>,
}

impl std::fmt::Debug for CatalogService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogService")
            .field("sku_count", &self.skus.read().len())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl Default for CatalogService {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogService {
    pub fn new() -> Self {
        Self {
            skus: Arc::new(RwLock::new(HashMap::new())),
            refresh_gate: Arc::new(tokio::sync::RwLock::new(())),
            stock_sync_epoch: Arc::new(AtomicU64::new(0)),
            degraded: Arc::new(AtomicBool::new(false)),
            last_refreshed_at: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Build a cache pre-filled with SKUs
    pub fn with_skus(skus: impl IntoIterator<Item = Sku>) -> Self {
        let service = Self::new();
        {
            let mut cache = service.skus.write();
            for sku in skus {
                cache.insert(sku.id.clone(), sku);
            }
        }
        service
    }

    // ========== Reads ==========

    pub fn get(&self, sku: &str) -> Option<Sku> {
        self.skus.read().get(sku).cloned()
    }

    pub fn on_hand(&self, sku: &str) -> Option<i64> {
        self.skus.read().get(sku).map(|s| s.on_hand)
    }

    /// All SKUs sorted by id
    pub fn list(&self) -> Vec<Sku> {
        let mut skus: Vec<Sku> = self.skus.read().values().cloned().collect();
        skus.sort_by(|a, b| a.id.cmp(&b.id));
        skus
    }

    pub fn len(&self) -> usize {
        self.skus.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.skus.read().is_empty()
    }

    /// Last refresh failed and the snapshot may be stale
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn last_refreshed_at(&self) -> i64 {
        self.last_refreshed_at.load(Ordering::Acquire)
    }

    // ========== Writes ==========

    /// Insert or replace one SKU
    pub fn upsert(&self, sku: Sku) {
        self.skus.write().insert(sku.id.clone(), sku);
    }

    /// Shared access to the refresh gate (held across a stock mutation)
    pub async fn stock_gate(&self) -> OwnedRwLockReadGuard<()> {
        self.refresh_gate.clone().read_owned().await
    }

    /// Apply a signed on-hand change; refuses to go negative
    ///
    /// Callers must hold the SKU's sequencer guard.
    pub fn apply_delta(&self, sku: &str, delta: i64) -> Result<i64, StockError> {
        let mut cache = self.skus.write();
        let entry = cache
            .get_mut(sku)
            .ok_or_else(|| StockError::UnknownSku(sku.to_string()))?;
        let next = entry.on_hand + delta;
        if next < 0 {
            return Err(StockError::NegativeStock {
                sku: sku.to_string(),
                on_hand: entry.on_hand,
                delta,
            });
        }
        entry.on_hand = next;
        Ok(next)
    }

    /// Record that the ledger acknowledged a stock delta
    pub fn note_stock_acknowledged(&self) {
        self.stock_sync_epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn stock_sync_epoch(&self) -> u64 {
        self.stock_sync_epoch.load(Ordering::Acquire)
    }

    // ========== Refresh ==========

    /// Refresh the snapshot from the external ledger
    ///
    /// On fetch failure (including timeout) the current snapshot is kept and
    /// the degraded flag is set.
    pub async fn refresh(
        &self,
        ledger: &dyn ExternalLedger,
        storage: &OrderStorage,
        timeout: Duration,
    ) -> Result<RefreshReport, LedgerError> {
        let epoch_before = self.stock_sync_epoch();

        let rows = match tokio::time::timeout(timeout, ledger.fetch_catalog()).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                self.degraded.store(true, Ordering::Release);
                tracing::warn!(error = %e, "Catalog refresh failed, keeping stale snapshot");
                return Err(e);
            }
            Err(_) => {
                self.degraded.store(true, Ordering::Release);
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Catalog refresh timed out, keeping stale snapshot");
                return Err(LedgerError::Timeout);
            }
        };

        let _gate = self.refresh_gate.write().await;

        let mut skip_quantities = self.stock_sync_epoch() != epoch_before;
        let pending = match storage.pending_stock_deltas() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read pending stock deltas, keeping local quantities");
                skip_quantities = true;
                HashMap::new()
            }
        };

        let sku_count = rows.len();
        {
            let mut cache = self.skus.write();
            let mut next: HashMap<String, Sku> = HashMap::with_capacity(rows.len());
            for mut row in rows {
                match cache.get(&row.id) {
                    Some(current) if skip_quantities => row.on_hand = current.on_hand,
                    _ => {
                        let pending_delta = pending.get(&row.id).copied().unwrap_or(0);
                        row.on_hand = (row.on_hand + pending_delta).max(0);
                    }
                }
                next.insert(row.id.clone(), row);
            }
            *cache = next;
        }

        self.degraded.store(false, Ordering::Release);
        self.last_refreshed_at
            .store(shared::util::now_millis(), Ordering::Release);

        if skip_quantities {
            tracing::info!(sku_count, "Catalog refreshed (stock acknowledged mid-fetch, quantities kept)");
        } else {
            tracing::info!(sku_count, pending = pending.len(), "Catalog refreshed");
        }

        Ok(RefreshReport {
            sku_count,
            quantities_skipped: skip_quantities,
        })
    }
}
