//! redb-based storage layer for orders, holds and the sync outbox
//!
//! # Tables
//!
//! | Table | Key | Value | Purpose |
//! |-------|-----|-------|---------|
//! | `orders` | `order_id` | `OrderSnapshot` | Order records |
//! | `order_events` | `(order_id, seq)` | `OrderEvent` | Order history (append-only) |
//! | `reservations` | `(order_id, reservation_id)` | `Reservation` | Hold history per order |
//! | `active_holds` | `(sku, reservation_id)` | `HoldEntry` | Unreleased holds per SKU |
//! | `slots` | `courier\|date\|time` | `order_id` | Courier slot exclusivity |
//! | `outbox` | `{order_id}:{kind}` | `OutboxEntry` | Pending external writes |
//! | `outbox_dead_letter` | `{order_id}:{kind}` | `OutboxEntry` | Writes the ledger permanently rejected |
//! | `idempotency` | caller key | `IdempotencyRecord` | Deduplicated responses |
//! | `wallets` | `customer_id` | `BonusWallet` | Bonus balances |
//! | `carts` | `customer_id` | `Vec<CartLine>` | Customer carts |
//! | `sequence_counter` | name | `u64` | Order number counter |
//!
//! # Durability
//!
//! redb commits are durable once `commit()` returns. Every multi-table change
//! (order + holds + outbox) goes through one `WriteTransaction`, and redb
//! serializes write transactions, so a check done inside a transaction cannot
//! be invalidated by a concurrent writer before the commit.

use super::outbox::{OutboxEntry, SyncOp};
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};
use shared::order::{
    CartLine, OrderEvent, OrderEventType, OrderSnapshot, OrderStatus, Reservation,
};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Orders: key = order_id, value = JSON-serialized OrderSnapshot
const ORDERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("orders");

/// Order history: key = (order_id, seq), value = JSON-serialized OrderEvent
const EVENTS_TABLE: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("order_events");

/// Reservations: key = (order_id, reservation_id), value = JSON-serialized Reservation
const RESERVATIONS_TABLE: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("reservations");

/// Unreleased holds: key = (sku, reservation_id), value = JSON-serialized HoldEntry
const ACTIVE_HOLDS_TABLE: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("active_holds");

/// Slot claims: key = "courier|date|time", value = order_id
const SLOTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("slots");

/// Outbox: key = "{order_id}:{kind}", value = JSON-serialized OutboxEntry
const OUTBOX_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("outbox");

/// Dead letters: key = "{order_id}:{kind}", value = JSON-serialized OutboxEntry
const OUTBOX_DEAD_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("outbox_dead_letter");

/// Idempotency: key = scoped caller key, value = JSON-serialized IdempotencyRecord
const IDEMPOTENCY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("idempotency");

/// Wallets: key = customer_id, value = JSON-serialized BonusWallet
const WALLETS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("wallets");

/// Carts: key = customer_id, value = JSON-serialized Vec<CartLine>
const CARTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("carts");

/// Counters: key = counter name, value = u64
const SEQUENCE_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequence_counter");

const ORDER_COUNT_KEY: &str = "order_count";

/// Index row of `active_holds`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldEntry {
    pub order_id: String,
    pub quantity: u32,
    pub expires_at: i64,
}

/// Stored response of an idempotent call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub created_at: i64,
    pub response: serde_json::Value,
}

/// 客户积分钱包
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BonusWallet {
    pub customer_id: String,
    pub balance: f64,
    /// Number of paid orders (referral bonus fires on the first one)
    pub paid_orders: u32,
    pub referrer_id: Option<String>,
}

impl BonusWallet {
    fn empty(customer_id: &str) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            ..Default::default()
        }
    }
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Order storage backed by redb
#[derive(Clone)]
pub struct OrderStorage {
    db: Arc<Database>,
}

impl std::fmt::Debug for OrderStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderStorage").finish_non_exhaustive()
    }
}

impl OrderStorage {
    /// Open or create the database at the given path
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> StorageResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> StorageResult<Self> {
        let write_txn = db.begin_write()?;
        {
            // Create all tables if they don't exist
            let _ = write_txn.open_table(ORDERS_TABLE)?;
            let _ = write_txn.open_table(EVENTS_TABLE)?;
            let _ = write_txn.open_table(RESERVATIONS_TABLE)?;
            let _ = write_txn.open_table(ACTIVE_HOLDS_TABLE)?;
            let _ = write_txn.open_table(SLOTS_TABLE)?;
            let _ = write_txn.open_table(OUTBOX_TABLE)?;
            let _ = write_txn.open_table(OUTBOX_DEAD_TABLE)?;
            let _ = write_txn.open_table(IDEMPOTENCY_TABLE)?;
            let _ = write_txn.open_table(WALLETS_TABLE)?;
            let _ = write_txn.open_table(CARTS_TABLE)?;

            let mut seq_table = write_txn.open_table(SEQUENCE_TABLE)?;
            if seq_table.get(ORDER_COUNT_KEY)?.is_none() {
                seq_table.insert(ORDER_COUNT_KEY, 0u64)?;
            }
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Begin a write transaction
    pub fn begin_write(&self) -> StorageResult<WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    // ========== Order Counter ==========

    /// Increment and return the order counter (within transaction)
    pub fn next_order_number(&self, txn: &WriteTransaction) -> StorageResult<u64> {
        let mut table = txn.open_table(SEQUENCE_TABLE)?;
        let current = table
            .get(ORDER_COUNT_KEY)?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let next = current + 1;
        table.insert(ORDER_COUNT_KEY, next)?;
        Ok(next)
    }

    /// Current order counter (read-only)
    pub fn get_order_count(&self) -> StorageResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SEQUENCE_TABLE)?;
        Ok(table
            .get(ORDER_COUNT_KEY)?
            .map(|guard| guard.value())
            .unwrap_or(0))
    }

    // ========== Orders ==========

    /// Store an order (within transaction)
    pub fn put_order(&self, txn: &WriteTransaction, order: &OrderSnapshot) -> StorageResult<()> {
        let mut table = txn.open_table(ORDERS_TABLE)?;
        let value = serde_json::to_vec(order)?;
        table.insert(order.order_id.as_str(), value.as_slice())?;
        Ok(())
    }

    /// Load an order inside a write transaction
    pub fn load_order(
        &self,
        txn: &WriteTransaction,
        order_id: &str,
    ) -> StorageResult<Option<OrderSnapshot>> {
        let table = txn.open_table(ORDERS_TABLE)?;
        match table.get(order_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Get an order (read-only)
    pub fn get_order(&self, order_id: &str) -> StorageResult<Option<OrderSnapshot>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ORDERS_TABLE)?;
        match table.get(order_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// All orders in one of the given statuses
    pub fn get_orders_with_status(
        &self,
        statuses: &[OrderStatus],
    ) -> StorageResult<Vec<OrderSnapshot>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ORDERS_TABLE)?;

        let mut orders = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            let order: OrderSnapshot = serde_json::from_slice(value.value())?;
            if statuses.contains(&order.status) {
                orders.push(order);
            }
        }
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    /// Number of stored orders
    pub fn order_count(&self) -> StorageResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ORDERS_TABLE)?;
        Ok(table.len()?)
    }

    // ========== Order Events ==========

    /// Append a history event with the next per-order sequence (within transaction)
    pub fn append_event(
        &self,
        txn: &WriteTransaction,
        order_id: &str,
        event_type: OrderEventType,
        actor: &str,
        detail: Option<String>,
        now: i64,
    ) -> StorageResult<OrderEvent> {
        let mut table = txn.open_table(EVENTS_TABLE)?;
        let last_seq = {
            let mut range = table.range((order_id, 0u64)..=(order_id, u64::MAX))?;
            match range.next_back() {
                Some(result) => result?.0.value().1,
                None => 0,
            }
        };
        let event = OrderEvent {
            order_id: order_id.to_string(),
            seq: last_seq + 1,
            event_type,
            timestamp: now,
            actor: actor.to_string(),
            detail,
        };
        let value = serde_json::to_vec(&event)?;
        table.insert((order_id, event.seq), value.as_slice())?;
        Ok(event)
    }

    /// Get the history of an order, oldest first
    pub fn get_events(&self, order_id: &str) -> StorageResult<Vec<OrderEvent>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EVENTS_TABLE)?;

        let mut events = Vec::new();
        for result in table.range((order_id, 0u64)..=(order_id, u64::MAX))? {
            let (_key, value) = result?;
            let event: OrderEvent = serde_json::from_slice(value.value())?;
            events.push(event);
        }
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    // ========== Reservations ==========

    /// Insert a reservation and its hold index row (within transaction)
    pub fn insert_reservation(
        &self,
        txn: &WriteTransaction,
        reservation: &Reservation,
    ) -> StorageResult<()> {
        {
            let mut table = txn.open_table(RESERVATIONS_TABLE)?;
            let value = serde_json::to_vec(reservation)?;
            table.insert(
                (
                    reservation.order_id.as_str(),
                    reservation.reservation_id.as_str(),
                ),
                value.as_slice(),
            )?;
        }
        let mut holds = txn.open_table(ACTIVE_HOLDS_TABLE)?;
        let hold = HoldEntry {
            order_id: reservation.order_id.clone(),
            quantity: reservation.quantity,
            expires_at: reservation.expires_at,
        };
        let value = serde_json::to_vec(&hold)?;
        holds.insert(
            (reservation.sku.as_str(), reservation.reservation_id.as_str()),
            value.as_slice(),
        )?;
        Ok(())
    }

    /// Sum of active, unexpired holds for a SKU (within transaction)
    pub fn held_quantity(&self, txn: &WriteTransaction, sku: &str, now: i64) -> StorageResult<u64> {
        let table = txn.open_table(ACTIVE_HOLDS_TABLE)?;
        sum_holds(&table, sku, now)
    }

    /// Sum of active, unexpired holds for a SKU (read-only)
    pub fn get_held_quantity(&self, sku: &str, now: i64) -> StorageResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACTIVE_HOLDS_TABLE)?;
        sum_holds(&table, sku, now)
    }

    /// Release every unreleased reservation of an order (within transaction)
    ///
    /// Idempotent: already released rows are left untouched. Returns the
    /// number of reservations released by this call.
    pub fn release_reservations(
        &self,
        txn: &WriteTransaction,
        order_id: &str,
        now: i64,
    ) -> StorageResult<usize> {
        let mut released: Vec<Reservation> = Vec::new();
        {
            let mut table = txn.open_table(RESERVATIONS_TABLE)?;
            let mut pending: Vec<Reservation> = Vec::new();
            for result in table.range((order_id, "")..)? {
                let (key, value) = result?;
                if key.value().0 != order_id {
                    break;
                }
                let reservation: Reservation = serde_json::from_slice(value.value())?;
                if !reservation.released {
                    pending.push(reservation);
                }
            }
            for mut reservation in pending {
                reservation.released = true;
                reservation.released_at = Some(now);
                let value = serde_json::to_vec(&reservation)?;
                table.insert(
                    (order_id, reservation.reservation_id.as_str()),
                    value.as_slice(),
                )?;
                released.push(reservation);
            }
        }

        let mut holds = txn.open_table(ACTIVE_HOLDS_TABLE)?;
        for reservation in &released {
            holds.remove((reservation.sku.as_str(), reservation.reservation_id.as_str()))?;
        }
        Ok(released.len())
    }

    /// Quantity of one unexpired hold (within transaction), 0 when absent
    pub fn hold_quantity(
        &self,
        txn: &WriteTransaction,
        sku: &str,
        reservation_id: &str,
        now: i64,
    ) -> StorageResult<u64> {
        let table = txn.open_table(ACTIVE_HOLDS_TABLE)?;
        let hold = match table.get((sku, reservation_id))? {
            Some(value) => serde_json::from_slice::<HoldEntry>(value.value())?,
            None => return Ok(0),
        };
        if hold.expires_at > now {
            Ok(u64::from(hold.quantity))
        } else {
            Ok(0)
        }
    }

    /// Release a single reservation of an owner (within transaction)
    ///
    /// Returns `false` when it was already released or never existed.
    pub fn release_reservation(
        &self,
        txn: &WriteTransaction,
        owner_id: &str,
        reservation_id: &str,
        now: i64,
    ) -> StorageResult<bool> {
        let existing = {
            let table = txn.open_table(RESERVATIONS_TABLE)?;
            match table.get((owner_id, reservation_id))? {
                Some(value) => Some(serde_json::from_slice::<Reservation>(value.value())?),
                None => None,
            }
        };
        let Some(mut reservation) = existing.filter(|r| !r.released) else {
            return Ok(false);
        };
        reservation.released = true;
        reservation.released_at = Some(now);
        {
            let mut table = txn.open_table(RESERVATIONS_TABLE)?;
            let value = serde_json::to_vec(&reservation)?;
            table.insert((owner_id, reservation_id), value.as_slice())?;
        }
        let mut holds = txn.open_table(ACTIVE_HOLDS_TABLE)?;
        holds.remove((reservation.sku.as_str(), reservation_id))?;
        Ok(true)
    }

    /// Release holds whose expiry has passed (within transaction)
    ///
    /// Returns the orders that had at least one hold released.
    pub fn sweep_expired_holds(
        &self,
        txn: &WriteTransaction,
        now: i64,
    ) -> StorageResult<BTreeSet<String>> {
        let mut expired: Vec<(String, String, String)> = Vec::new();
        {
            let mut holds = txn.open_table(ACTIVE_HOLDS_TABLE)?;
            for result in holds.iter()? {
                let (key, value) = result?;
                let hold: HoldEntry = serde_json::from_slice(value.value())?;
                if hold.expires_at <= now {
                    let (sku, reservation_id) = key.value();
                    expired.push((sku.to_string(), reservation_id.to_string(), hold.order_id));
                }
            }
            for (sku, reservation_id, _) in &expired {
                holds.remove((sku.as_str(), reservation_id.as_str()))?;
            }
        }

        let mut table = txn.open_table(RESERVATIONS_TABLE)?;
        let mut orders = BTreeSet::new();
        for (_, reservation_id, order_id) in expired {
            let key = (order_id.as_str(), reservation_id.as_str());
            let existing = match table.get(key)? {
                Some(value) => Some(serde_json::from_slice::<Reservation>(value.value())?),
                None => None,
            };
            if let Some(mut reservation) = existing {
                reservation.released = true;
                reservation.released_at = Some(now);
                let value = serde_json::to_vec(&reservation)?;
                table.insert(key, value.as_slice())?;
            }
            orders.insert(order_id);
        }
        Ok(orders)
    }

    /// All reservations of an order (read-only)
    pub fn get_reservations(&self, order_id: &str) -> StorageResult<Vec<Reservation>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RESERVATIONS_TABLE)?;

        let mut reservations = Vec::new();
        for result in table.range((order_id, "")..)? {
            let (key, value) = result?;
            if key.value().0 != order_id {
                break;
            }
            reservations.push(serde_json::from_slice::<Reservation>(value.value())?);
        }
        reservations.sort_by_key(|r| r.created_at);
        Ok(reservations)
    }

    // ========== Slots ==========

    /// Claim a slot for an order (within transaction)
    ///
    /// Returns `false` when another order holds the slot.
    pub fn claim_slot(
        &self,
        txn: &WriteTransaction,
        slot_key: &str,
        order_id: &str,
    ) -> StorageResult<bool> {
        let mut table = txn.open_table(SLOTS_TABLE)?;
        let holder = table.get(slot_key)?.map(|g| g.value().to_string());
        match holder {
            Some(holder) if holder != order_id => Ok(false),
            Some(_) => Ok(true),
            None => {
                table.insert(slot_key, order_id)?;
                Ok(true)
            }
        }
    }

    /// Release a slot if it is held by the given order (within transaction)
    pub fn release_slot(
        &self,
        txn: &WriteTransaction,
        slot_key: &str,
        order_id: &str,
    ) -> StorageResult<()> {
        let mut table = txn.open_table(SLOTS_TABLE)?;
        let held_by_order = table
            .get(slot_key)?
            .is_some_and(|g| g.value() == order_id);
        if held_by_order {
            table.remove(slot_key)?;
        }
        Ok(())
    }

    /// Current holder of a slot (read-only)
    pub fn get_slot_holder(&self, slot_key: &str) -> StorageResult<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SLOTS_TABLE)?;
        Ok(table.get(slot_key)?.map(|g| g.value().to_string()))
    }

    // ========== Outbox ==========

    /// Enqueue an outbox entry unless its key is already pending (within transaction)
    ///
    /// Returns `true` if the entry was inserted.
    pub fn enqueue_outbox(&self, txn: &WriteTransaction, entry: &OutboxEntry) -> StorageResult<bool> {
        let mut table = txn.open_table(OUTBOX_TABLE)?;
        if table.get(entry.key.as_str())?.is_some() {
            return Ok(false);
        }
        let value = serde_json::to_vec(entry)?;
        table.insert(entry.key.as_str(), value.as_slice())?;
        Ok(true)
    }

    /// All pending outbox entries, oldest first
    pub fn get_pending_outbox(&self) -> StorageResult<Vec<OutboxEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTBOX_TABLE)?;

        let mut entries = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            entries.push(serde_json::from_slice::<OutboxEntry>(value.value())?);
        }
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(entries)
    }

    /// Get one outbox entry
    pub fn get_outbox_entry(&self, key: &str) -> StorageResult<Option<OutboxEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTBOX_TABLE)?;
        match table.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Whether an outbox key is still pending
    pub fn has_outbox_entry(&self, key: &str) -> StorageResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTBOX_TABLE)?;
        Ok(table.get(key)?.is_some())
    }

    /// Remove an acknowledged entry
    ///
    /// A `commit` acknowledgement also flips `ledger_committed` on the order
    /// in the same transaction.
    pub fn complete_outbox(&self, entry: &OutboxEntry) -> StorageResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(OUTBOX_TABLE)?;
            table.remove(entry.key.as_str())?;
        }
        if entry.is_commit()
            && let Some(mut order) = self.load_order(&txn, &entry.order_id)?
        {
            order.ledger_committed = true;
            self.put_order(&txn, &order)?;
            self.append_event(
                &txn,
                &entry.order_id,
                OrderEventType::LedgerCommitted,
                "system",
                Some(order.status.as_str().to_string()),
                shared::util::now_millis(),
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Drop an entry without delivering it (order purged)
    pub fn discard_outbox(&self, key: &str) -> StorageResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(OUTBOX_TABLE)?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Persist a failed delivery attempt (attempt counter and last error)
    pub fn mark_outbox_failed(&self, key: &str, error: &str, now: i64) -> StorageResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(OUTBOX_TABLE)?;
            let existing = match table.get(key)? {
                Some(value) => Some(serde_json::from_slice::<OutboxEntry>(value.value())?),
                None => None,
            };
            if let Some(mut entry) = existing {
                entry.attempts += 1;
                entry.last_error = Some(error.to_string());
                entry.last_attempt_at = Some(now);
                let value = serde_json::to_vec(&entry)?;
                table.insert(key, value.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Move an entry out of the pending outbox after a final failure
    ///
    /// The attempt counter and last error are kept on the dead-letter row.
    /// Returns `false` when the entry is no longer pending.
    pub fn dead_letter_outbox(&self, key: &str, error: &str, now: i64) -> StorageResult<bool> {
        let txn = self.db.begin_write()?;
        let moved = {
            let mut table = txn.open_table(OUTBOX_TABLE)?;
            let existing = match table.remove(key)? {
                Some(value) => Some(serde_json::from_slice::<OutboxEntry>(value.value())?),
                None => None,
            };
            match existing {
                Some(mut entry) => {
                    entry.attempts += 1;
                    entry.last_error = Some(error.to_string());
                    entry.last_attempt_at = Some(now);
                    let mut dead = txn.open_table(OUTBOX_DEAD_TABLE)?;
                    let value = serde_json::to_vec(&entry)?;
                    dead.insert(key, value.as_slice())?;
                    true
                }
                None => false,
            }
        };
        txn.commit()?;
        Ok(moved)
    }

    /// Dead-lettered entries, oldest first
    pub fn get_dead_letters(&self) -> StorageResult<Vec<OutboxEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTBOX_DEAD_TABLE)?;

        let mut entries = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            entries.push(serde_json::from_slice::<OutboxEntry>(value.value())?);
        }
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    /// Net unsynced stock delta per SKU
    pub fn pending_stock_deltas(&self) -> StorageResult<HashMap<String, i64>> {
        let mut totals: HashMap<String, i64> = HashMap::new();
        for entry in self.get_pending_outbox()? {
            if let SyncOp::AdjustStock { deltas } = entry.op {
                for d in deltas {
                    *totals.entry(d.sku).or_insert(0) += d.delta;
                }
            }
        }
        totals.retain(|_, delta| *delta != 0);
        Ok(totals)
    }

    // ========== Idempotency ==========

    /// Look up a stored response (within transaction)
    pub fn load_idempotent(
        &self,
        txn: &WriteTransaction,
        key: &str,
    ) -> StorageResult<Option<IdempotencyRecord>> {
        let table = txn.open_table(IDEMPOTENCY_TABLE)?;
        match table.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Store a response under a caller key (within transaction)
    pub fn put_idempotent(
        &self,
        txn: &WriteTransaction,
        key: &str,
        response: serde_json::Value,
        now: i64,
    ) -> StorageResult<()> {
        let mut table = txn.open_table(IDEMPOTENCY_TABLE)?;
        let record = IdempotencyRecord {
            created_at: now,
            response,
        };
        let value = serde_json::to_vec(&record)?;
        table.insert(key, value.as_slice())?;
        Ok(())
    }

    /// Delete idempotency records created before `cutoff`
    pub fn purge_idempotency(&self, cutoff: i64) -> StorageResult<usize> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(IDEMPOTENCY_TABLE)?;
            let mut stale: Vec<String> = Vec::new();
            for result in table.iter()? {
                let (key, value) = result?;
                let record: IdempotencyRecord = serde_json::from_slice(value.value())?;
                if record.created_at < cutoff {
                    stale.push(key.value().to_string());
                }
            }
            for key in &stale {
                table.remove(key.as_str())?;
            }
            stale.len()
        };
        txn.commit()?;
        Ok(removed)
    }

    // ========== Wallets ==========

    /// Load a wallet, empty if absent (within transaction)
    pub fn load_wallet(&self, txn: &WriteTransaction, customer_id: &str) -> StorageResult<BonusWallet> {
        let table = txn.open_table(WALLETS_TABLE)?;
        match table.get(customer_id)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Ok(BonusWallet::empty(customer_id)),
        }
    }

    /// Store a wallet (within transaction)
    pub fn put_wallet(&self, txn: &WriteTransaction, wallet: &BonusWallet) -> StorageResult<()> {
        let mut table = txn.open_table(WALLETS_TABLE)?;
        let value = serde_json::to_vec(wallet)?;
        table.insert(wallet.customer_id.as_str(), value.as_slice())?;
        Ok(())
    }

    /// Get a wallet, empty if absent (read-only)
    pub fn get_wallet(&self, customer_id: &str) -> StorageResult<BonusWallet> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(WALLETS_TABLE)?;
        match table.get(customer_id)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Ok(BonusWallet::empty(customer_id)),
        }
    }

    // ========== Carts ==========

    /// Load a cart (within transaction)
    pub fn load_cart(&self, txn: &WriteTransaction, customer_id: &str) -> StorageResult<Vec<CartLine>> {
        let table = txn.open_table(CARTS_TABLE)?;
        match table.get(customer_id)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Ok(Vec::new()),
        }
    }

    /// Store a cart; an empty cart removes the row (within transaction)
    pub fn put_cart(
        &self,
        txn: &WriteTransaction,
        customer_id: &str,
        lines: &[CartLine],
    ) -> StorageResult<()> {
        let mut table = txn.open_table(CARTS_TABLE)?;
        if lines.is_empty() {
            table.remove(customer_id)?;
        } else {
            let value = serde_json::to_vec(lines)?;
            table.insert(customer_id, value.as_slice())?;
        }
        Ok(())
    }

    /// Get a cart (read-only)
    pub fn get_cart(&self, customer_id: &str) -> StorageResult<Vec<CartLine>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CARTS_TABLE)?;
        match table.get(customer_id)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Ok(Vec::new()),
        }
    }

    // ========== Purge ==========

    /// Permanently delete an order with its reservations, holds, history and slot
    /// (within transaction)
    pub fn delete_order(&self, txn: &WriteTransaction, order: &OrderSnapshot) -> StorageResult<()> {
        let order_id = order.order_id.as_str();

        let mut reservations: Vec<(String, String)> = Vec::new();
        {
            let mut table = txn.open_table(RESERVATIONS_TABLE)?;
            for result in table.range((order_id, "")..)? {
                let (key, value) = result?;
                if key.value().0 != order_id {
                    break;
                }
                let reservation: Reservation = serde_json::from_slice(value.value())?;
                reservations.push((reservation.reservation_id, reservation.sku));
            }
            for (reservation_id, _) in &reservations {
                table.remove((order_id, reservation_id.as_str()))?;
            }
        }
        {
            let mut holds = txn.open_table(ACTIVE_HOLDS_TABLE)?;
            for (reservation_id, sku) in &reservations {
                holds.remove((sku.as_str(), reservation_id.as_str()))?;
            }
        }
        {
            let mut events = txn.open_table(EVENTS_TABLE)?;
            let mut seqs: Vec<u64> = Vec::new();
            for result in events.range((order_id, 0u64)..=(order_id, u64::MAX))? {
                let (key, _value) = result?;
                seqs.push(key.value().1);
            }
            for seq in seqs {
                events.remove((order_id, seq))?;
            }
        }
        if let Some(slot_key) = order.slot_key() {
            self.release_slot(txn, &slot_key, order_id)?;
        }
        let mut orders = txn.open_table(ORDERS_TABLE)?;
        orders.remove(order_id)?;
        Ok(())
    }
}

fn sum_holds<T>(table: &T, sku: &str, now: i64) -> StorageResult<u64>
where
    T: ReadableTable<(&'static str, &'static str), &'static [u8]>,
{
    let mut total = 0u64;
    for result in table.range((sku, "")..)? {
        let (key, value) = result?;
        if key.value().0 != sku {
            break;
        }
        let hold: HoldEntry = serde_json::from_slice(value.value())?;
        if hold.expires_at > now {
            total += u64::from(hold.quantity);
        }
    }
    Ok(total)
}
