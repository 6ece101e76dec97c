//! Order Audit Store
//!
//! Append-mostly log of executed order commands. The persistent store is a
//! collaborator; the worker only inserts rows and updates their status, so
//! the seam is a trait with an in-memory adapter bundled for tests and
//! single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::config::TradingMode;
use crate::models::{InternalOrderStatus, OrderAction, UpstreamOrderStatus};

// =============================================================================
// Rows
// =============================================================================

/// One audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAuditRecord {
    /// Row id; the caller-facing order handle.
    pub id: i64,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Last status update time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Trading mode the command ran under.
    pub mode: TradingMode,
    /// Symbol the caller used.
    pub symbol: String,
    /// Exchange code the order went out under.
    pub exchange_code: String,
    /// Directional intent.
    pub action: OrderAction,
    /// Quantity submitted.
    pub quantity: u32,
    /// Internal status.
    pub status: InternalOrderStatus,
    /// Raw upstream status from the last reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_status: Option<UpstreamOrderStatus>,
    /// Filled quantity.
    pub fill_quantity: u32,
    /// Average fill price, if any fills.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<Decimal>,
    /// Cancelled quantity.
    pub cancel_quantity: u32,
    /// Upstream order identifier, absent when submission failed outright.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_order_id: Option<String>,
    /// Upstream sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seqno: Option<String>,
    /// Upstream failure message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

/// Fields of a row being inserted.
#[derive(Debug, Clone)]
pub struct NewOrderAudit {
    /// Trading mode the command ran under.
    pub mode: TradingMode,
    /// Symbol the caller used.
    pub symbol: String,
    /// Exchange code the order went out under.
    pub exchange_code: String,
    /// Directional intent.
    pub action: OrderAction,
    /// Quantity submitted.
    pub quantity: u32,
    /// Internal status at insertion.
    pub status: InternalOrderStatus,
    /// Upstream order identifier if the submission was acknowledged.
    pub upstream_order_id: Option<String>,
    /// Upstream sequence number.
    pub seqno: Option<String>,
    /// Upstream failure message when the submission was refused.
    pub failure_message: Option<String>,
}

/// Fields updated by reconciliation (`recheck_order`, `cancel_order`).
#[derive(Debug, Clone, Default)]
pub struct AuditStatusUpdate {
    /// New internal status.
    pub status: Option<InternalOrderStatus>,
    /// New raw upstream status.
    pub fill_status: Option<UpstreamOrderStatus>,
    /// New filled quantity.
    pub fill_quantity: Option<u32>,
    /// New average fill price.
    pub fill_price: Option<Decimal>,
    /// New cancelled quantity.
    pub cancel_quantity: Option<u32>,
    /// New failure message.
    pub failure_message: Option<String>,
}

// =============================================================================
// Store
// =============================================================================

/// Audit store failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuditError {
    /// The backing store could not be reached.
    #[error("audit store unavailable: {0}")]
    Unavailable(String),
}

/// Interface the worker writes audit rows through.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Insert a row, returning it with its assigned id.
    async fn insert(&self, row: NewOrderAudit) -> Result<OrderAuditRecord, AuditError>;

    /// Fetch a row by id.
    async fn find(&self, id: i64) -> Result<Option<OrderAuditRecord>, AuditError>;

    /// Apply a status update to a row. Returns the updated row, or `None`
    /// when the id is unknown.
    async fn update_status(
        &self,
        id: i64,
        update: AuditStatusUpdate,
    ) -> Result<Option<OrderAuditRecord>, AuditError>;
}

/// In-memory audit store.
pub struct InMemoryAuditStore {
    rows: Mutex<BTreeMap<i64, OrderAuditRecord>>,
    next_id: AtomicI64,
}

impl InMemoryAuditStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Whether the store holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Snapshot all rows, ordered by id.
    #[must_use]
    pub fn all(&self) -> Vec<OrderAuditRecord> {
        self.rows.lock().values().cloned().collect()
    }
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn insert(&self, row: NewOrderAudit) -> Result<OrderAuditRecord, AuditError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = OrderAuditRecord {
            id,
            created_at: Utc::now(),
            updated_at: None,
            mode: row.mode,
            symbol: row.symbol,
            exchange_code: row.exchange_code,
            action: row.action,
            quantity: row.quantity,
            status: row.status,
            fill_status: None,
            fill_quantity: 0,
            fill_price: None,
            cancel_quantity: 0,
            upstream_order_id: row.upstream_order_id,
            seqno: row.seqno,
            failure_message: row.failure_message,
        };
        self.rows.lock().insert(id, record.clone());
        Ok(record)
    }

    async fn find(&self, id: i64) -> Result<Option<OrderAuditRecord>, AuditError> {
        Ok(self.rows.lock().get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: i64,
        update: AuditStatusUpdate,
    ) -> Result<Option<OrderAuditRecord>, AuditError> {
        let mut rows = self.rows.lock();
        let Some(record) = rows.get_mut(&id) else {
            return Ok(None);
        };

        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(fill_status) = update.fill_status {
            record.fill_status = Some(fill_status);
        }
        if let Some(fill_quantity) = update.fill_quantity {
            record.fill_quantity = fill_quantity;
        }
        if let Some(fill_price) = update.fill_price {
            record.fill_price = Some(fill_price);
        }
        if let Some(cancel_quantity) = update.cancel_quantity {
            record.cancel_quantity = cancel_quantity;
        }
        if let Some(failure_message) = update.failure_message {
            record.failure_message = Some(failure_message);
        }
        record.updated_at = Some(Utc::now());

        Ok(Some(record.clone()))
    }
}

// =============================================================================
// Tests
// =============================================================================
