//! OrdersManager - order state machine, reservations and payment side effects
//!
//! This module handles:
//! - Admission (catalog lookup, pricing, stock holds) in one write transaction
//! - Legal status transitions and their side effects
//! - Stock deduction/return through the per-SKU sequencer
//! - Outbox entries written with the order change that requires them
//! - Event broadcasting after commit
//!
//! # Operation Flow
//!
//! ```text
//! operation(order_id, ...)
//!     ├─ 1. Pre-read + validation (cheap rejection)
//!     ├─ 2. Async collaborators (courier directory, stock lease)
//!     ├─ 3. Begin write transaction
//!     ├─ 4. Re-load order and re-validate
//!     ├─ 5. Stock / holds / slot / wallet / outbox changes
//!     ├─ 6. Persist snapshot + history event
//!     ├─ 7. Commit (on failure: revert in-memory stock)
//!     ├─ 8. Post-commit stock returns
//!     └─ 9. Broadcast event(s), wake the sync worker
//! ```
//!
//! A write transaction is never held across an `.await`.

mod error;
pub use error::*;

use super::money::{self, MAX_QUANTITY};
use super::outbox::{OutboxEntry, OutboxKind};
use super::storage::{OrderStorage, StorageError};
use crate::inventory::{DeductOutcome, SkuSequencer, StockKeeper, StockLease, return_deltas};
use crate::pricing::{PricingPolicy, price_order};
use crate::services::{CatalogService, CourierDirectory, Notifier, NotifyOutcome};
use chrono::{NaiveDate, NaiveTime};
use redb::WriteTransaction;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shared::models::Sku;
use shared::order::{
    Actor, CartLine, ContactDetails, DeductedLine, DeliveryMethod, DeliverySlot, ItemInput,
    OrderEvent, OrderEventType, OrderSnapshot, OrderStatus, PaymentMethod, PaymentRecord,
    Reservation,
};
use shared::util::now_millis;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Event broadcast channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Runtime knobs of the manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Lifetime of stock holds
    pub reservation_ttl_ms: i64,
    /// Lifetime of stored idempotent responses
    pub idempotency_ttl_ms: i64,
    /// Pending orders older than this are cancelled by the safety sweep
    pub pending_outer_bound_ms: i64,
    /// not_issued orders older than this are purged
    pub not_issued_purge_age_ms: i64,
    /// Percent of the paid amount credited back to the wallet
    pub cashback_percent: f64,
    /// Credited to the referrer on the referred customer's first paid order
    pub referral_bonus: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_ms: 30 * 60 * 1000,
            idempotency_ttl_ms: 10 * 60 * 1000,
            pending_outer_bound_ms: 24 * 60 * 60 * 1000,
            not_issued_purge_age_ms: 7 * 24 * 60 * 60 * 1000,
            cashback_percent: 5.0,
            referral_bonus: 50.0,
        }
    }
}

/// Result of a successful creation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateOrderOutcome {
    pub order_id: String,
    pub order_number: String,
    pub total: f64,
    /// Reservation expiry (Unix millis)
    pub expires_at: i64,
}

/// Result of a recorded payment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentOutcome {
    pub order_id: String,
    pub status: OrderStatus,
    pub final_amount: f64,
    pub bonus_applied: f64,
    pub cashback: f64,
}

impl PaymentOutcome {
    fn from_order(order: &OrderSnapshot) -> Option<Self> {
        order.payment.as_ref().map(|p| Self {
            order_id: order.order_id.clone(),
            status: order.status,
            final_amount: p.final_amount,
            bonus_applied: p.bonus_applied,
            cashback: p.cashback,
        })
    }
}

/// Committed changes to publish
#[derive(Default)]
struct Published {
    events: Vec<OrderEvent>,
    outbox_keys: Vec<String>,
}

/// OrdersManager for the order lifecycle
pub struct OrdersManager {
    storage: OrderStorage,
    catalog: Arc<CatalogService>,
    stock: StockKeeper,
    pricing: PricingPolicy,
    couriers: Arc<dyn CourierDirectory>,
    notifier: Arc<dyn Notifier>,
    config: ManagerConfig,
    event_tx: broadcast::Sender<OrderEvent>,
    /// Wakes the sync worker when an outbox entry is committed
    outbox_tx: Option<mpsc::Sender<String>>,
}

impl std::fmt::Debug for OrdersManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrdersManager")
            .field("storage", &"<OrderStorage>")
            .field("event_tx", &"<broadcast::Sender>")
            .field("config", &self.config)
            .finish()
    }
}

impl OrdersManager {
    pub fn new(
        storage: OrderStorage,
        catalog: Arc<CatalogService>,
        couriers: Arc<dyn CourierDirectory>,
        notifier: Arc<dyn Notifier>,
        config: ManagerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let stock = StockKeeper::new(catalog.clone(), Arc::new(SkuSequencer::new()));
        Self {
            storage,
            catalog,
            stock,
            pricing: PricingPolicy::default(),
            couriers,
            notifier,
            config,
            event_tx,
            outbox_tx: None,
        }
    }

    pub fn with_pricing(mut self, pricing: PricingPolicy) -> Self {
        self.pricing = pricing;
        self
    }

    /// Set the channel used to wake the sync worker
    pub fn set_outbox_notifier(&mut self, tx: mpsc::Sender<String>) {
        self.outbox_tx = Some(tx);
    }

    /// Subscribe to committed order events
    pub fn subscribe(&self) -> broadcast::Receiver<OrderEvent> {
        self.event_tx.subscribe()
    }

    pub fn storage(&self) -> &OrderStorage {
        &self.storage
    }

    pub fn catalog(&self) -> &Arc<CatalogService> {
        &self.catalog
    }

    pub fn sequencer(&self) -> &Arc<SkuSequencer> {
        self.stock.sequencer()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn publish(&self, published: Published) {
        for event in published.events {
            // No subscribers is fine
            let _ = self.event_tx.send(event);
        }
        if let Some(tx) = &self.outbox_tx {
            for key in published.outbox_keys {
                if let Err(e) = tx.try_send(key) {
                    tracing::debug!(error = %e, "Sync worker not woken, periodic scan will pick the entry up");
                }
            }
        }
    }

    fn load(&self, txn: &WriteTransaction, order_id: &str) -> ManagerResult<OrderSnapshot> {
        self.storage
            .load_order(txn, order_id)?
            .ok_or_else(|| ManagerError::OrderNotFound(order_id.to_string()))
    }

    fn require(&self, order_id: &str) -> ManagerResult<OrderSnapshot> {
        self.storage
            .get_order(order_id)?
            .ok_or_else(|| ManagerError::OrderNotFound(order_id.to_string()))
    }

    fn enqueue(
        &self,
        txn: &WriteTransaction,
        entry: OutboxEntry,
        published: &mut Published,
    ) -> ManagerResult<()> {
        if self.storage.enqueue_outbox(txn, &entry)? {
            published.outbox_keys.push(entry.key);
        }
        Ok(())
    }

    fn fresh_idempotent<T: serde::de::DeserializeOwned>(
        &self,
        txn: &WriteTransaction,
        key: Option<&str>,
        now: i64,
    ) -> ManagerResult<Option<T>> {
        let Some(key) = key else {
            return Ok(None);
        };
        match self.storage.load_idempotent(txn, key)? {
            Some(record) if record.created_at + self.config.idempotency_ttl_ms > now => {
                let response = serde_json::from_value(record.response).map_err(StorageError::from)?;
                tracing::debug!(key = %key, "Returning stored idempotent response");
                Ok(Some(response))
            }
            _ => Ok(None),
        }
    }

    fn store_idempotent<T: Serialize>(
        &self,
        txn: &WriteTransaction,
        key: Option<&str>,
        response: &T,
        now: i64,
    ) -> ManagerResult<()> {
        if let Some(key) = key {
            let value = serde_json::to_value(response).map_err(StorageError::from)?;
            self.storage.put_idempotent(txn, key, value, now)?;
        }
        Ok(())
    }

    // ========================================================================
    // Admission
    // ========================================================================

    fn resolve_items(&self, items: &[ItemInput]) -> ManagerResult<Vec<(ItemInput, Sku)>> {
        if items.is_empty() {
            return Err(ManagerError::EmptyOrder);
        }
        items
            .iter()
            .map(|item| {
                if item.quantity == 0 || item.quantity > MAX_QUANTITY {
                    return Err(ManagerError::InvalidQuantity {
                        sku: item.sku.clone(),
                        quantity: item.quantity,
                    });
                }
                let sku = self
                    .catalog
                    .get(&item.sku)
                    .ok_or_else(|| ManagerError::UnknownSku(item.sku.clone()))?;
                if !sku.active {
                    return Err(ManagerError::InactiveSku(item.sku.clone()));
                }
                Ok((item.clone(), sku))
            })
            .collect()
    }

    /// Create an order in `buffer` and hold stock for every line
    ///
    /// All-or-nothing: the availability check and the hold rows are written in
    /// the same redb write transaction.
    pub fn create_order(
        &self,
        customer_id: &str,
        items: Vec<ItemInput>,
        promo_code: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> ManagerResult<CreateOrderOutcome> {
        self.create(customer_id, Some(items), promo_code, idempotency_key)
    }

    /// Create an order from the customer's cart (the cart is cleared on payment)
    ///
    /// The cart holds move to the order in the same transaction, so stock
    /// held by the cart stays claimed by this customer.
    pub fn create_order_from_cart(
        &self,
        customer_id: &str,
        promo_code: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> ManagerResult<CreateOrderOutcome> {
        self.create(customer_id, None, promo_code, idempotency_key)
    }

    /// `items = None` takes the lines of the cart
    fn create(
        &self,
        customer_id: &str,
        items: Option<Vec<ItemInput>>,
        promo_code: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> ManagerResult<CreateOrderOutcome> {
        let now = now_millis();
        let idem_key = idempotency_key.map(|k| format!("create:{}:{}", customer_id, k));

        let txn = self.storage.begin_write()?;
        if let Some(outcome) = self.fresh_idempotent(&txn, idem_key.as_deref(), now)? {
            return Ok(outcome);
        }

        let items = match items {
            Some(items) => items,
            None => {
                // Dropping the transaction on a later error restores the cart holds
                self.storage
                    .release_reservations(&txn, &cart_owner(customer_id), now)?;
                self.storage
                    .load_cart(&txn, customer_id)?
                    .into_iter()
                    .map(|line| ItemInput::new(line.sku, line.quantity))
                    .collect()
            }
        };

        let resolved = self.resolve_items(&items)?;
        let priced = price_order(&resolved, &self.pricing, promo_code)?;

        let mut demand: BTreeMap<&str, u32> = BTreeMap::new();
        for item in &items {
            let entry = demand.entry(item.sku.as_str()).or_insert(0);
            *entry = entry.saturating_add(item.quantity);
        }
        for (sku, requested) in &demand {
            let on_hand = self.catalog.on_hand(sku).unwrap_or(0).max(0) as u64;
            let held = self.storage.held_quantity(&txn, sku, now)?;
            let available = on_hand.saturating_sub(held);
            if u64::from(*requested) > available {
                tracing::info!(
                    customer_id = %customer_id,
                    sku = %sku,
                    requested,
                    available,
                    "Order rejected: insufficient stock"
                );
                return Err(ManagerError::InsufficientStock {
                    sku: sku.to_string(),
                    requested: *requested,
                    available,
                });
            }
        }

        let order_id = uuid::Uuid::new_v4().to_string();
        let order_number = format!("ORD-{:06}", self.storage.next_order_number(&txn)?);
        let expires_at = now + self.config.reservation_ttl_ms;

        for item in &items {
            let reservation = Reservation {
                reservation_id: uuid::Uuid::new_v4().to_string(),
                order_id: order_id.clone(),
                sku: item.sku.clone(),
                quantity: item.quantity,
                created_at: now,
                expires_at,
                released: false,
                released_at: None,
            };
            self.storage.insert_reservation(&txn, &reservation)?;
        }

        let order = OrderSnapshot {
            order_id: order_id.clone(),
            order_number: order_number.clone(),
            customer_id: customer_id.to_string(),
            items: priced.items,
            subtotal: priced.subtotal,
            discount: priced.discount,
            total: priced.total,
            promo_code: priced.promo_code,
            status: OrderStatus::Buffer,
            reservation_expires_at: expires_at,
            delivery_method: None,
            contact: None,
            courier_id: None,
            delivery_slot: None,
            payment: None,
            deducted: Vec::new(),
            ledger_committed: false,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
            paid_at: None,
            delivered_at: None,
            cancelled_at: None,
            expired_at: None,
            not_issued_at: None,
            not_issued_reason: None,
        };
        self.storage.put_order(&txn, &order)?;
        let event = self.storage.append_event(
            &txn,
            &order_id,
            OrderEventType::OrderCreated,
            &Actor::Customer(customer_id.to_string()).to_string(),
            Some(format!("lines={} total={:.2}", order.items.len(), order.total)),
            now,
        )?;

        let outcome = CreateOrderOutcome {
            order_id,
            order_number,
            total: order.total,
            expires_at,
        };
        self.store_idempotent(&txn, idem_key.as_deref(), &outcome, now)?;
        txn.commit().map_err(StorageError::from)?;

        tracing::info!(
            order_id = %outcome.order_id,
            order_number = %outcome.order_number,
            customer_id = %customer_id,
            total = outcome.total,
            "Order created"
        );
        self.publish(Published {
            events: vec![event],
            outbox_keys: Vec::new(),
        });
        Ok(outcome)
    }

    // ========================================================================
    // Confirmation / courier / slot
    // ========================================================================

    /// buffer → pending: attach delivery method and contact details
    pub fn confirm_order(
        &self,
        order_id: &str,
        customer_id: &str,
        delivery_method: DeliveryMethod,
        contact: ContactDetails,
    ) -> ManagerResult<OrderSnapshot> {
        if contact.phone.trim().is_empty() {
            return Err(ManagerError::Validation("contact phone is required".into()));
        }
        if delivery_method == DeliveryMethod::Courier
            && contact.address.as_deref().is_none_or(|a| a.trim().is_empty())
        {
            return Err(ManagerError::Validation(
                "delivery address is required for courier delivery".into(),
            ));
        }

        let now = now_millis();
        let txn = self.storage.begin_write()?;
        let mut order = self.load(&txn, order_id)?;
        if order.customer_id != customer_id {
            return Err(ManagerError::NotOwner(order_id.to_string()));
        }
        if order.status != OrderStatus::Buffer {
            return Err(ManagerError::IllegalTransition {
                from: order.status,
                to: OrderStatus::Pending,
            });
        }
        if order.reservation_expires_at <= now {
            return Err(ManagerError::ReservationExpired(order_id.to_string()));
        }

        let mut published = Published::default();
        order.delivery_method = Some(delivery_method);
        order.contact = Some(contact);
        order.status = OrderStatus::Pending;
        order.confirmed_at = Some(now);
        order.updated_at = now;
        self.storage.put_order(&txn, &order)?;
        self.enqueue(&txn, OutboxEntry::append(order_id, now), &mut published)?;
        published.events.push(self.storage.append_event(
            &txn,
            order_id,
            OrderEventType::OrderConfirmed,
            &Actor::Customer(customer_id.to_string()).to_string(),
            Some(format!("method={}", delivery_method.as_str())),
            now,
        )?);
        txn.commit().map_err(StorageError::from)?;

        tracing::info!(order_id = %order_id, method = delivery_method.as_str(), "Order confirmed");
        self.publish(published);
        Ok(order)
    }

    /// pending/courier_assigned → courier_assigned
    pub async fn assign_courier(
        &self,
        order_id: &str,
        courier_id: &str,
    ) -> ManagerResult<OrderSnapshot> {
        let pre = self.require(order_id)?;
        check_assignable(&pre)?;

        let profile = self
            .couriers
            .get_courier(courier_id)
            .await
            .ok_or_else(|| ManagerError::CourierNotFound(courier_id.to_string()))?;

        let now = now_millis();
        let mut published = Published::default();
        let order = {
            let txn = self.storage.begin_write()?;
            let mut order = self.load(&txn, order_id)?;
            check_assignable(&order)?;
            if !profile.is_available_at(order.delivery_slot.map(|s| s.time)) {
                return Err(ManagerError::CourierUnavailable(courier_id.to_string()));
            }

            let old_key = order.slot_key();
            if let Some(slot) = order.delivery_slot {
                let new_key = slot.key_for(courier_id);
                if !self.storage.claim_slot(&txn, &new_key, order_id)? {
                    return Err(ManagerError::SlotTaken(new_key));
                }
                if let Some(old_key) = old_key.filter(|k| *k != new_key) {
                    self.storage.release_slot(&txn, &old_key, order_id)?;
                }
            }

            order.courier_id = Some(courier_id.to_string());
            order.status = OrderStatus::CourierAssigned;
            order.updated_at = now;
            self.storage.put_order(&txn, &order)?;
            published.events.push(self.storage.append_event(
                &txn,
                order_id,
                OrderEventType::CourierAssigned,
                &Actor::Admin.to_string(),
                Some(format!("courier={}", courier_id)),
                now,
            )?);
            txn.commit().map_err(StorageError::from)?;
            order
        };

        tracing::info!(order_id = %order_id, courier_id = %courier_id, "Courier assigned");
        self.publish(published);

        let text = match order.delivery_slot {
            Some(slot) => format!(
                "Order {} assigned to you for {} {}",
                order.order_number,
                slot.date.format("%Y-%m-%d"),
                slot.time.format("%H:%M")
            ),
            None => format!("Order {} assigned to you", order.order_number),
        };
        if let NotifyOutcome::Failed(reason) = self.notifier.notify(courier_id, &text).await {
            tracing::warn!(order_id = %order_id, courier_id = %courier_id, reason = %reason, "Courier notification failed");
        }
        Ok(order)
    }

    /// Set or move the delivery slot of a non-terminal order
    ///
    /// With a courier assigned, the `(courier, date, time)` slot must be free.
    pub async fn set_delivery_slot(
        &self,
        order_id: &str,
        date: NaiveDate,
        time: NaiveTime,
    ) -> ManagerResult<OrderSnapshot> {
        let pre = self.require(order_id)?;
        check_open(&pre)?;

        let profile = match &pre.courier_id {
            Some(courier_id) => self.couriers.get_courier(courier_id).await,
            None => None,
        };

        let now = now_millis();
        let slot = DeliverySlot::new(date, time);
        let mut published = Published::default();

        let txn = self.storage.begin_write()?;
        let mut order = self.load(&txn, order_id)?;
        check_open(&order)?;

        if let Some(courier_id) = order.courier_id.clone() {
            if let Some(profile) = profile.as_ref().filter(|p| p.courier_id == courier_id)
                && !profile.is_available_at(Some(time))
            {
                return Err(ManagerError::CourierUnavailable(courier_id));
            }
            let new_key = slot.key_for(&courier_id);
            if !self.storage.claim_slot(&txn, &new_key, order_id)? {
                return Err(ManagerError::SlotTaken(new_key));
            }
            if let Some(old_key) = order.slot_key().filter(|k| *k != new_key) {
                self.storage.release_slot(&txn, &old_key, order_id)?;
            }
        }

        order.delivery_slot = Some(slot);
        order.updated_at = now;
        self.storage.put_order(&txn, &order)?;
        published.events.push(self.storage.append_event(
            &txn,
            order_id,
            OrderEventType::SlotSet,
            &Actor::Admin.to_string(),
            Some(format!("{} {}", date.format("%Y-%m-%d"), time.format("%H:%M"))),
            now,
        )?);
        txn.commit().map_err(StorageError::from)?;

        tracing::info!(order_id = %order_id, date = %date, time = %time, "Delivery slot set");
        self.publish(published);
        Ok(order)
    }

    // ========================================================================
    // Payment
    // ========================================================================

    /// Record a payment: deduct stock, release holds, settle the bonus wallet
    ///
    /// Idempotent per order: a paid order returns its stored outcome without
    /// side effects. Stock lines that cannot be deducted are logged and the
    /// payment still goes through. Status is unchanged.
    pub async fn record_payment(
        &self,
        order_id: &str,
        customer_id: &str,
        method: PaymentMethod,
        bonus: Option<f64>,
        idempotency_key: Option<&str>,
    ) -> ManagerResult<PaymentOutcome> {
        let requested_bonus = match bonus {
            Some(b) => money::validate_bonus(b).map_err(ManagerError::InvalidBonus)?,
            None => Decimal::ZERO,
        };
        let idem_key = idempotency_key.map(|k| format!("pay:{}:{}", order_id, k));

        let pre = self.require(order_id)?;
        if pre.customer_id != customer_id {
            return Err(ManagerError::NotOwner(order_id.to_string()));
        }
        if let Some(prior) = PaymentOutcome::from_order(&pre) {
            return Ok(prior);
        }
        check_payable(&pre)?;

        let skus = pre.quantities_by_sku();
        let lease = self.stock.lease(skus.iter().map(|(s, _)| s.as_str())).await;
        let now = now_millis();

        let txn = self.storage.begin_write()?;
        if let Some(outcome) = self.fresh_idempotent(&txn, idem_key.as_deref(), now)? {
            return Ok(outcome);
        }
        let order = self.load(&txn, order_id)?;
        if order.customer_id != customer_id {
            return Err(ManagerError::NotOwner(order_id.to_string()));
        }
        if let Some(prior) = PaymentOutcome::from_order(&order) {
            return Ok(prior);
        }
        check_payable(&order)?;

        let deduction = if order.is_stock_deducted() {
            DeductOutcome::default()
        } else {
            lease.deduct(order_id, &order.quantities_by_sku())
        };
        if !deduction.refused.is_empty() {
            tracing::warn!(
                order_id = %order_id,
                refused = deduction.refused.len(),
                "Payment recorded with undeducted lines"
            );
        }

        let (outcome, published) = match self.write_payment(
            txn,
            order,
            &deduction,
            method,
            requested_bonus,
            idem_key.as_deref(),
            now,
        ) {
            Ok(done) => done,
            Err(e) => {
                lease.revert(order_id, &deduction.applied);
                return Err(e);
            }
        };
        drop(lease);

        tracing::info!(
            order_id = %order_id,
            final_amount = outcome.final_amount,
            bonus_applied = outcome.bonus_applied,
            cashback = outcome.cashback,
            "Payment recorded"
        );
        self.publish(published);
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_payment(
        &self,
        txn: WriteTransaction,
        mut order: OrderSnapshot,
        deduction: &DeductOutcome,
        method: PaymentMethod,
        requested_bonus: Decimal,
        idem_key: Option<&str>,
        now: i64,
    ) -> ManagerResult<(PaymentOutcome, Published)> {
        let mut published = Published::default();
        let order_id = order.order_id.clone();
        let customer_id = order.customer_id.clone();

        // Bonus wallet
        let total = money::to_decimal(order.total);
        let mut wallet = self.storage.load_wallet(&txn, &customer_id)?;
        let balance = money::to_decimal(wallet.balance);
        let bonus = money::round2(requested_bonus.min(balance).min(total).max(Decimal::ZERO));
        let final_amount = money::round2(total - bonus);
        let cashback =
            money::percent_of(final_amount, money::to_decimal(self.config.cashback_percent));
        wallet.balance = money::to_f64(balance - bonus + cashback);
        wallet.paid_orders += 1;
        let referrer = if wallet.paid_orders == 1 {
            wallet.referrer_id.clone()
        } else {
            None
        };
        self.storage.put_wallet(&txn, &wallet)?;

        if let Some(referrer_id) = referrer
            && self.config.referral_bonus > 0.0
        {
            let mut referrer_wallet = self.storage.load_wallet(&txn, &referrer_id)?;
            referrer_wallet.balance = money::to_f64(
                money::to_decimal(referrer_wallet.balance)
                    + money::to_decimal(self.config.referral_bonus),
            );
            self.storage.put_wallet(&txn, &referrer_wallet)?;
            tracing::info!(referrer_id = %referrer_id, customer_id = %customer_id, "Referral bonus credited");
        }

        // Stock
        if !deduction.applied.is_empty() {
            order.deducted.extend(deduction.applied.iter().cloned());
            let entry = OutboxEntry::stock(&order_id, OutboxKind::Stock, deduction.deltas(), now);
            self.enqueue(&txn, entry, &mut published)?;
        }
        self.storage.release_reservations(&txn, &order_id, now)?;
        self.storage
            .release_reservations(&txn, &cart_owner(&customer_id), now)?;
        self.storage.put_cart(&txn, &customer_id, &[])?;

        order.payment = Some(PaymentRecord {
            method,
            bonus_applied: money::to_f64(bonus),
            final_amount: money::to_f64(final_amount),
            cashback: money::to_f64(cashback),
            paid_at: now,
        });
        order.paid_at = Some(now);
        order.updated_at = now;
        self.storage.put_order(&txn, &order)?;
        published.events.push(self.storage.append_event(
            &txn,
            &order_id,
            OrderEventType::PaymentRecorded,
            &Actor::Customer(customer_id.clone()).to_string(),
            Some(format!("final_amount={:.2} bonus={:.2}", final_amount, bonus)),
            now,
        )?);

        let outcome = PaymentOutcome::from_order(&order)
            .ok_or_else(|| ManagerError::Internal("payment record missing".into()))?;
        self.store_idempotent(&txn, idem_key, &outcome, now)?;
        txn.commit().map_err(StorageError::from)?;
        Ok((outcome, published))
    }

    // ========================================================================
    // Terminal transitions
    // ========================================================================

    /// → delivered (assigned courier or admin)
    pub async fn mark_delivered(&self, order_id: &str, actor: &Actor) -> ManagerResult<OrderSnapshot> {
        self.close(order_id, actor, OrderStatus::Delivered, None).await
    }

    /// → not_issued (assigned courier or admin); deducted stock is returned
    pub async fn mark_not_issued(
        &self,
        order_id: &str,
        actor: &Actor,
        reason: Option<String>,
    ) -> ManagerResult<OrderSnapshot> {
        self.close(order_id, actor, OrderStatus::NotIssued, reason).await
    }

    /// → cancelled (owning customer or admin); deducted stock is returned
    pub async fn cancel_order(&self, order_id: &str, actor: &Actor) -> ManagerResult<OrderSnapshot> {
        self.close(order_id, actor, OrderStatus::Cancelled, None).await
    }

    async fn close(
        &self,
        order_id: &str,
        actor: &Actor,
        target: OrderStatus,
        reason: Option<String>,
    ) -> ManagerResult<OrderSnapshot> {
        let pre = self.require(order_id)?;
        check_close(&pre, actor, target)?;

        // Deducted lines are a subset of the items
        let skus = pre.quantities_by_sku();
        let lease = self.stock.lease(skus.iter().map(|(s, _)| s.as_str())).await;
        let now = now_millis();

        let (order, returned, published) =
            self.close_in_txn(&lease, order_id, actor, target, reason, now)?;
        if !returned.is_empty() {
            lease.restock(order_id, &returned);
        }
        drop(lease);

        tracing::info!(
            order_id = %order_id,
            status = %target,
            actor = %actor,
            returned_lines = returned.len(),
            "Order closed"
        );
        self.publish(published);
        Ok(order)
    }

    fn close_in_txn(
        &self,
        lease: &StockLease,
        order_id: &str,
        actor: &Actor,
        target: OrderStatus,
        reason: Option<String>,
        now: i64,
    ) -> ManagerResult<(OrderSnapshot, Vec<DeductedLine>, Published)> {
        let txn = self.storage.begin_write()?;
        let order = self.load(&txn, order_id)?;
        check_close(&order, actor, target)?;

        let mut deduction = DeductOutcome::default();
        if target == OrderStatus::Delivered && !order.is_stock_deducted() {
            deduction = lease.deduct(order_id, &order.quantities_by_sku());
            // Only a payment that already happened justifies going on
            if !order.is_paid()
                && let Some(err) = deduction.refused.first()
            {
                lease.revert(order_id, &deduction.applied);
                return Err(ManagerError::Stock(err.clone()));
            }
        }

        match self.write_close(txn, order, &deduction, actor, target, reason, now) {
            Ok(done) => Ok(done),
            Err(e) => {
                lease.revert(order_id, &deduction.applied);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_close(
        &self,
        txn: WriteTransaction,
        mut order: OrderSnapshot,
        deduction: &DeductOutcome,
        actor: &Actor,
        target: OrderStatus,
        reason: Option<String>,
        now: i64,
    ) -> ManagerResult<(OrderSnapshot, Vec<DeductedLine>, Published)> {
        let mut published = Published::default();
        let order_id = order.order_id.clone();
        let mut returned = Vec::new();

        let event_type = match target {
            OrderStatus::Delivered => {
                if !deduction.applied.is_empty() {
                    order.deducted.extend(deduction.applied.iter().cloned());
                    let entry =
                        OutboxEntry::stock(&order_id, OutboxKind::Stock, deduction.deltas(), now);
                    self.enqueue(&txn, entry, &mut published)?;
                }
                order.delivered_at = Some(now);
                OrderEventType::OrderDelivered
            }
            OrderStatus::Cancelled | OrderStatus::NotIssued => {
                if order.is_stock_deducted() {
                    returned = order.deducted.clone();
                    let entry = OutboxEntry::stock(
                        &order_id,
                        OutboxKind::StockReturn,
                        return_deltas(&returned),
                        now,
                    );
                    self.enqueue(&txn, entry, &mut published)?;
                }
                if target == OrderStatus::Cancelled {
                    order.cancelled_at = Some(now);
                    OrderEventType::OrderCancelled
                } else {
                    order.not_issued_at = Some(now);
                    order.not_issued_reason = reason.clone();
                    OrderEventType::OrderNotIssued
                }
            }
            other => {
                return Err(ManagerError::Internal(format!(
                    "unsupported close target: {}",
                    other
                )));
            }
        };

        self.finish_terminal(&txn, &mut order, target, now, &mut published)?;
        self.storage.put_order(&txn, &order)?;
        published.events.push(self.storage.append_event(
            &txn,
            &order_id,
            event_type,
            &actor.to_string(),
            reason,
            now,
        )?);
        txn.commit().map_err(StorageError::from)?;
        Ok((order, returned, published))
    }

    /// Shared tail of every terminal transition: holds, slot, status, commit entry
    ///
    /// Only confirmed orders were appended to the ledger, so only they get a
    /// `commit`.
    fn finish_terminal(
        &self,
        txn: &WriteTransaction,
        order: &mut OrderSnapshot,
        target: OrderStatus,
        now: i64,
        published: &mut Published,
    ) -> ManagerResult<()> {
        self.storage
            .release_reservations(txn, &order.order_id, now)?;
        if let Some(slot_key) = order.slot_key() {
            self.storage.release_slot(txn, &slot_key, &order.order_id)?;
        }
        order.status = target;
        order.updated_at = now;
        if order.confirmed_at.is_none() {
            return Ok(());
        }
        order.ledger_committed = false;
        self.enqueue(
            txn,
            OutboxEntry::commit(&order.order_id, target, now),
            published,
        )
    }

    // ========================================================================
    // Sweeps
    // ========================================================================

    /// Release expired holds and expire unconfirmed orders
    ///
    /// Orders with a delivery method keep their status (they are past
    /// confirmation); their holds are released all the same. Expired cart
    /// holds are released too while the cart lines stay.
    pub fn expire_overdue(&self, now: i64) -> ManagerResult<Vec<String>> {
        let mut published = Published::default();
        let mut expired = Vec::new();

        let txn = self.storage.begin_write()?;
        let swept = self.storage.sweep_expired_holds(&txn, now)?;
        for order_id in &swept {
            let Some(mut order) = self.storage.load_order(&txn, order_id)? else {
                continue;
            };
            let expirable = matches!(order.status, OrderStatus::Buffer | OrderStatus::Pending)
                && !order.has_delivery_method();
            if !expirable {
                continue;
            }
            order.expired_at = Some(now);
            self.finish_terminal(&txn, &mut order, OrderStatus::Expired, now, &mut published)?;
            self.storage.put_order(&txn, &order)?;
            published.events.push(self.storage.append_event(
                &txn,
                order_id,
                OrderEventType::OrderExpired,
                &Actor::System.to_string(),
                Some("reservation expired".to_string()),
                now,
            )?);
            expired.push(order_id.clone());
        }
        txn.commit().map_err(StorageError::from)?;

        if !swept.is_empty() {
            tracing::info!(
                swept_orders = swept.len(),
                expired = expired.len(),
                "Expired holds released"
            );
        }
        self.publish(published);
        Ok(expired)
    }

    /// Cancel pending orders older than the outer bound
    pub async fn cancel_stale_pending(&self, now: i64) -> ManagerResult<Vec<String>> {
        let stale: Vec<OrderSnapshot> = self
            .storage
            .get_orders_with_status(&[OrderStatus::Pending])?
            .into_iter()
            .filter(|o| o.created_at + self.config.pending_outer_bound_ms <= now)
            .collect();

        let mut cancelled = Vec::new();
        for order in stale {
            match self
                .close(
                    &order.order_id,
                    &Actor::System,
                    OrderStatus::Cancelled,
                    Some("pending outer bound exceeded".to_string()),
                )
                .await
            {
                Ok(_) => cancelled.push(order.order_id),
                Err(e) => {
                    tracing::warn!(order_id = %order.order_id, error = %e, "Failed to cancel stale pending order");
                }
            }
        }
        if !cancelled.is_empty() {
            tracing::info!(count = cancelled.len(), "Stale pending orders cancelled");
        }
        Ok(cancelled)
    }

    /// Permanently delete not_issued orders older than the purge age
    pub fn purge_not_issued(&self, now: i64) -> ManagerResult<usize> {
        let candidates: Vec<OrderSnapshot> = self
            .storage
            .get_orders_with_status(&[OrderStatus::NotIssued])?
            .into_iter()
            .filter(|o| {
                o.not_issued_at.unwrap_or(o.updated_at) + self.config.not_issued_purge_age_ms <= now
            })
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let txn = self.storage.begin_write()?;
        for order in &candidates {
            self.storage.delete_order(&txn, order)?;
        }
        txn.commit().map_err(StorageError::from)?;

        tracing::info!(count = candidates.len(), "Purged not_issued orders");
        Ok(candidates.len())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_order(&self, order_id: &str) -> ManagerResult<Option<OrderSnapshot>> {
        Ok(self.storage.get_order(order_id)?)
    }

    /// On-hand minus active holds, clamped at 0
    pub fn get_available_quantity(&self, sku: &str) -> ManagerResult<i64> {
        let on_hand = self
            .catalog
            .on_hand(sku)
            .ok_or_else(|| ManagerError::UnknownSku(sku.to_string()))?;
        let held = self.storage.get_held_quantity(sku, now_millis())?;
        let held = i64::try_from(held).unwrap_or(i64::MAX);
        Ok(on_hand.saturating_sub(held).max(0))
    }

    pub fn orders_with_status(&self, statuses: &[OrderStatus]) -> ManagerResult<Vec<OrderSnapshot>> {
        Ok(self.storage.get_orders_with_status(statuses)?)
    }

    pub fn order_events(&self, order_id: &str) -> ManagerResult<Vec<OrderEvent>> {
        Ok(self.storage.get_events(order_id)?)
    }

    // ========================================================================
    // Cart
    // ========================================================================

    /// Add units of a SKU to the customer's cart and hold them
    ///
    /// The line's hold is resized to the new cart quantity with a fresh
    /// expiry. Admission uses the same availability check as `create_order`,
    /// with the line's own previous hold counted as available.
    pub fn add_to_cart(
        &self,
        customer_id: &str,
        sku: &str,
        quantity: u32,
    ) -> ManagerResult<Vec<CartLine>> {
        self.resolve_items(&[ItemInput::new(sku, quantity)])?;
        let now = now_millis();

        let txn = self.storage.begin_write()?;
        let mut lines = self.storage.load_cart(&txn, customer_id)?;
        let next = lines
            .iter()
            .find(|l| l.sku == sku)
            .map_or(quantity, |l| l.quantity.saturating_add(quantity));
        if next > MAX_QUANTITY {
            return Err(ManagerError::InvalidQuantity {
                sku: sku.to_string(),
                quantity: next,
            });
        }

        let hold_id = cart_hold_id(customer_id, sku);
        let on_hand = self.catalog.on_hand(sku).unwrap_or(0).max(0) as u64;
        let held = self.storage.held_quantity(&txn, sku, now)?;
        let own = self.storage.hold_quantity(&txn, sku, &hold_id, now)?;
        let available = on_hand.saturating_sub(held.saturating_sub(own));
        if u64::from(next) > available {
            tracing::info!(
                customer_id = %customer_id,
                sku = %sku,
                requested = next,
                available,
                "Cart line rejected: insufficient stock"
            );
            return Err(ManagerError::InsufficientStock {
                sku: sku.to_string(),
                requested: next,
                available,
            });
        }

        let owner = cart_owner(customer_id);
        self.storage.release_reservation(&txn, &owner, &hold_id, now)?;
        self.storage.insert_reservation(
            &txn,
            &Reservation {
                reservation_id: hold_id,
                order_id: owner,
                sku: sku.to_string(),
                quantity: next,
                created_at: now,
                expires_at: now + self.config.reservation_ttl_ms,
                released: false,
                released_at: None,
            },
        )?;

        match lines.iter_mut().find(|l| l.sku == sku) {
            Some(line) => line.quantity = next,
            None => lines.push(CartLine {
                sku: sku.to_string(),
                quantity: next,
            }),
        }
        self.storage.put_cart(&txn, customer_id, &lines)?;
        txn.commit().map_err(StorageError::from)?;
        tracing::debug!(customer_id = %customer_id, sku = %sku, quantity = next, "Cart line held");
        Ok(lines)
    }

    /// Drop a cart line and release its hold
    pub fn remove_from_cart(&self, customer_id: &str, sku: &str) -> ManagerResult<Vec<CartLine>> {
        let now = now_millis();
        let txn = self.storage.begin_write()?;
        let mut lines = self.storage.load_cart(&txn, customer_id)?;
        lines.retain(|l| l.sku != sku);
        self.storage.release_reservation(
            &txn,
            &cart_owner(customer_id),
            &cart_hold_id(customer_id, sku),
            now,
        )?;
        self.storage.put_cart(&txn, customer_id, &lines)?;
        txn.commit().map_err(StorageError::from)?;
        Ok(lines)
    }

    pub fn get_cart(&self, customer_id: &str) -> ManagerResult<Vec<CartLine>> {
        Ok(self.storage.get_cart(customer_id)?)
    }

    // ========================================================================
    // Bonus wallet
    // ========================================================================

    pub fn wallet_balance(&self, customer_id: &str) -> ManagerResult<f64> {
        Ok(self.storage.get_wallet(customer_id)?.balance)
    }

    /// Link a customer to the referrer who brought them
    ///
    /// Only before the first paid order, and only once.
    pub fn register_referral(&self, customer_id: &str, referrer_id: &str) -> ManagerResult<()> {
        if customer_id == referrer_id {
            return Err(ManagerError::Validation("customer cannot refer themselves".into()));
        }
        let txn = self.storage.begin_write()?;
        let mut wallet = self.storage.load_wallet(&txn, customer_id)?;
        if wallet.referrer_id.is_some() {
            return Err(ManagerError::Validation("referrer already registered".into()));
        }
        if wallet.paid_orders > 0 {
            return Err(ManagerError::Validation(
                "referral must be registered before the first paid order".into(),
            ));
        }
        wallet.referrer_id = Some(referrer_id.to_string());
        self.storage.put_wallet(&txn, &wallet)?;
        txn.commit().map_err(StorageError::from)?;
        tracing::info!(customer_id = %customer_id, referrer_id = %referrer_id, "Referral registered");
        Ok(())
    }

    /// Manual top-up; returns the new balance
    pub fn credit_bonus(&self, customer_id: &str, amount: f64) -> ManagerResult<f64> {
        let amount = money::validate_bonus(amount).map_err(ManagerError::InvalidBonus)?;
        let txn = self.storage.begin_write()?;
        let mut wallet = self.storage.load_wallet(&txn, customer_id)?;
        wallet.balance = money::to_f64(money::to_decimal(wallet.balance) + amount);
        self.storage.put_wallet(&txn, &wallet)?;
        txn.commit().map_err(StorageError::from)?;
        Ok(wallet.balance)
    }
}

/// Owner id of a customer's cart holds in the reservation tables
fn cart_owner(customer_id: &str) -> String {
    format!("cart:{}", customer_id)
}

fn cart_hold_id(customer_id: &str, sku: &str) -> String {
    format!("cart:{}:{}", customer_id, sku)
}

// ============================================================================
// Transition guards
// ============================================================================

fn check_open(order: &OrderSnapshot) -> ManagerResult<()> {
    if order.status.is_terminal() {
        return Err(ManagerError::IllegalTransition {
            from: order.status,
            to: order.status,
        });
    }
    Ok(())
}

fn check_assignable(order: &OrderSnapshot) -> ManagerResult<()> {
    match order.status {
        OrderStatus::Pending | OrderStatus::CourierAssigned => Ok(()),
        from => Err(ManagerError::IllegalTransition {
            from,
            to: OrderStatus::CourierAssigned,
        }),
    }
}

fn check_payable(order: &OrderSnapshot) -> ManagerResult<()> {
    if order.status.is_terminal() {
        return Err(ManagerError::IllegalTransition {
            from: order.status,
            to: OrderStatus::Pending,
        });
    }
    if !order.has_delivery_method() {
        return Err(ManagerError::NotConfirmed(order.order_id.clone()));
    }
    Ok(())
}

fn check_close(order: &OrderSnapshot, actor: &Actor, target: OrderStatus) -> ManagerResult<()> {
    if order.status.is_terminal() {
        return Err(ManagerError::IllegalTransition {
            from: order.status,
            to: target,
        });
    }
    match target {
        OrderStatus::Cancelled => match actor {
            Actor::Customer(id) if *id == order.customer_id => {}
            Actor::Customer(_) | Actor::Courier(_) => {
                return Err(ManagerError::NotOwner(order.order_id.clone()));
            }
            Actor::Admin | Actor::System => {}
        },
        OrderStatus::Delivered | OrderStatus::NotIssued => match actor {
            Actor::Courier(id) if order.courier_id.as_deref() == Some(id.as_str()) => {}
            Actor::Courier(_) | Actor::Customer(_) => {
                return Err(ManagerError::NotAssignedCourier(order.order_id.clone()));
            }
            Actor::Admin | Actor::System => {}
        },
        _ => {}
    }
    if target == OrderStatus::Delivered
        && order.delivery_method == Some(DeliveryMethod::Courier)
        && order.courier_id.is_none()
    {
        return Err(ManagerError::NoCourierAssigned(order.order_id.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
