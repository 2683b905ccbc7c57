//! HttpLedger: JSON-over-HTTP adapter for the external ledger
//!
//! The ledger is a loosely structured table: column names vary and cells may
//! hold numbers as strings. All column aliasing and cell coercion lives here;
//! the engine only ever sees [`Sku`] and [`LedgerOrderRow`].

use super::{ExternalLedger, LedgerError, LedgerOrderRow};
use crate::orders::outbox::StockDelta;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value, json};
use shared::models::Sku;
use shared::order::OrderStatus;
use std::time::Duration;

const ID_COLUMNS: &[&str] = &["id", "sku", "code", "article"];
const NAME_COLUMNS: &[&str] = &["name", "title", "product"];
const PRICE_COLUMNS: &[&str] = &["unit_price", "price", "retail_price"];
const CATEGORY_COLUMNS: &[&str] = &["category", "group", "section"];
const STOCK_COLUMNS: &[&str] = &["on_hand", "stock", "quantity", "qty", "balance"];
const ACTIVE_COLUMNS: &[&str] = &["active", "is_active", "enabled", "visible"];
const BULK_COLUMNS: &[&str] = &["bulk_price", "wholesale_price", "bulk"];

/// HTTP client for the ledger API
pub struct HttpLedger {
    client: Client,
    base_url: String,
}

impl std::fmt::Debug for HttpLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLedger")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpLedger {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, LedgerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(LedgerError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> LedgerError {
    if e.is_timeout() {
        LedgerError::Timeout
    } else if e.is_decode() {
        LedgerError::Decode(e.to_string())
    } else {
        LedgerError::Transport(e.to_string())
    }
}

#[async_trait]
impl ExternalLedger for HttpLedger {
    async fn fetch_catalog(&self) -> Result<Vec<Sku>, LedgerError> {
        let response = self
            .client
            .get(self.url("/catalog"))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let rows: Vec<Map<String, Value>> = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(map_reqwest_error)?;

        let mut skus = Vec::with_capacity(rows.len());
        for row in &rows {
            match sku_from_row(row) {
                Some(sku) => skus.push(sku),
                None => tracing::warn!(row = ?row, "Skipping catalog row without id/name/price"),
            }
        }
        Ok(skus)
    }

    async fn find_order(&self, order_id: &str) -> Result<Option<LedgerOrderRow>, LedgerError> {
        let response = self
            .client
            .get(self.url(&format!("/orders/{order_id}")))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let row: LedgerOrderRow = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(map_reqwest_error)?;
        Ok(Some(row))
    }

    async fn append_order(&self, row: &LedgerOrderRow) -> Result<(), LedgerError> {
        let response = self
            .client
            .post(self.url("/orders"))
            .json(row)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn commit_status(&self, order_id: &str, status: OrderStatus) -> Result<(), LedgerError> {
        let response = self
            .client
            .post(self.url(&format!("/orders/{order_id}/status")))
            .json(&json!({ "status": status.as_str() }))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn apply_stock(&self, op_id: &str, deltas: &[StockDelta]) -> Result<(), LedgerError> {
        let response = self
            .client
            .post(self.url("/stock"))
            .header("Idempotency-Key", op_id)
            .json(&json!({ "deltas": deltas }))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Self::expect_success(response).await?;
        Ok(())
    }
}

// =============================================================================
// Row coercion
// =============================================================================

fn normalize_column(name: &str) -> String {
    name.trim().to_lowercase().replace([' ', '-'], "_")
}

fn cell<'a>(row: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    row.iter()
        .find(|(key, value)| !value.is_null() && aliases.contains(&normalize_column(key).as_str()))
        .map(|(_, value)| value)
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .replace(' ', "")
            .replace(',', ".")
            .parse::<f64>()
            .ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|n| n != 0.0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" | "on" | "active" => Some(true),
            "false" | "no" | "n" | "0" | "off" | "inactive" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Map one loosely typed ledger row onto [`Sku`]
fn sku_from_row(row: &Map<String, Value>) -> Option<Sku> {
    let id = cell(row, ID_COLUMNS).and_then(as_text)?;
    let name = cell(row, NAME_COLUMNS).and_then(as_text)?;
    let unit_price = cell(row, PRICE_COLUMNS).and_then(as_number)?;
    let on_hand = cell(row, STOCK_COLUMNS)
        .and_then(as_number)
        .map(|n| n.floor().max(0.0) as i64)
        .unwrap_or(0);

    Some(Sku {
        id,
        name,
        unit_price,
        category: cell(row, CATEGORY_COLUMNS)
            .and_then(as_text)
            .unwrap_or_default(),
        on_hand,
        active: cell(row, ACTIVE_COLUMNS).and_then(as_flag).unwrap_or(true),
        bulk_price: cell(row, BULK_COLUMNS)
            .and_then(as_number)
            .filter(|p| *p > 0.0),
    })
}
