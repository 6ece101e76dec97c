//! Command Envelope Types
//!
//! The request/response wire shape carried over the correlation bus. The
//! command set is closed: every job the worker can perform is a variant of
//! [`Command`], serialized adjacently tagged so the wire form is
//! `{"command": "place_order", "payload": {...}}`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Unique identifier correlating a request with its reply slot.
pub type RequestId = String;

// =============================================================================
// Command Kinds
// =============================================================================

/// The closed set of command kinds the worker dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Submit an order derived from a directional intent.
    PlaceOrder,
    /// Cancel a previously submitted order.
    CancelOrder,
    /// Force-refresh upstream order status and reconcile the audit row.
    RecheckOrder,
    /// List open positions.
    ListPositions,
    /// Query account margin figures.
    QueryMargin,
    /// Query realized/unrealized profit and loss.
    QueryProfitLoss,
    /// List executed trades.
    ListTrades,
    /// List settlement records.
    ListSettlements,
    /// List tradable symbols from the contract catalog.
    ListSymbols,
    /// Detail for one symbol from the contract catalog.
    SymbolInfo,
    /// One-shot upstream market snapshot for a symbol.
    SymbolSnapshot,
    /// Query upstream data usage counters.
    QueryUsage,
    /// Join the refcounted quote subscription for a symbol.
    SubscribeQuote,
    /// Leave the refcounted quote subscription for a symbol.
    UnsubscribeQuote,
}

impl CommandKind {
    /// Wire name of the command kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PlaceOrder => "place_order",
            Self::CancelOrder => "cancel_order",
            Self::RecheckOrder => "recheck_order",
            Self::ListPositions => "list_positions",
            Self::QueryMargin => "query_margin",
            Self::QueryProfitLoss => "query_profit_loss",
            Self::ListTrades => "list_trades",
            Self::ListSettlements => "list_settlements",
            Self::ListSymbols => "list_symbols",
            Self::SymbolInfo => "symbol_info",
            Self::SymbolSnapshot => "symbol_snapshot",
            Self::QueryUsage => "query_usage",
            Self::SubscribeQuote => "subscribe_quote",
            Self::UnsubscribeQuote => "unsubscribe_quote",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Order Command
// =============================================================================

/// Directional intent of an order command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderAction {
    /// Open (or grow) a long position.
    LongEntry,
    /// Close an existing long position.
    LongExit,
    /// Open (or grow) a short position.
    ShortEntry,
    /// Close an existing short position.
    ShortExit,
}

impl OrderAction {
    /// Whether this action opens a position.
    #[must_use]
    pub const fn is_entry(self) -> bool {
        matches!(self, Self::LongEntry | Self::ShortEntry)
    }

    /// Whether this action closes a position.
    #[must_use]
    pub const fn is_exit(self) -> bool {
        !self.is_entry()
    }

    /// Wire name of the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LongEntry => "long_entry",
            Self::LongExit => "long_exit",
            Self::ShortEntry => "short_entry",
            Self::ShortExit => "short_exit",
        }
    }
}

impl std::fmt::Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Price type for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceType {
    /// Market order; the price field is ignored.
    #[default]
    Market,
    /// Limit order; requires a positive price.
    Limit,
}

/// Order duration submitted to the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDuration {
    /// Rest on the book for the session.
    Day,
    /// Fill completely or cancel.
    FillOrKill,
    /// Fill what is immediately available, cancel the rest.
    #[default]
    ImmediateOrCancel,
}

/// A validated directional order intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCommand {
    /// Directional intent.
    pub action: OrderAction,
    /// Client-facing symbol (may be a near-month pseudo-symbol).
    pub symbol: String,
    /// Contract count, at least 1.
    pub quantity: u32,
    /// Limit price; required for limit orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    /// Market or limit.
    #[serde(default)]
    pub price_type: PriceType,
    /// Order duration.
    #[serde(default)]
    pub order_type: OrderDuration,
}

impl OrderCommand {
    /// Validate caller-supplied fields.
    ///
    /// # Errors
    ///
    /// Returns a human-readable message for a non-positive quantity or a
    /// limit order without a positive price.
    pub fn validate(&self) -> Result<(), String> {
        if self.quantity == 0 {
            return Err("quantity must be at least 1".to_string());
        }
        if self.price_type == PriceType::Limit {
            match self.price {
                Some(p) if p > Decimal::ZERO => {}
                _ => return Err("limit orders require a positive price".to_string()),
            }
        }
        Ok(())
    }
}

// =============================================================================
// Command Payloads
// =============================================================================

/// A command with its payload, adjacently tagged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum Command {
    /// Submit an order.
    PlaceOrder(OrderCommand),
    /// Cancel an order by audit row id.
    CancelOrder {
        /// Audit row id returned by `place_order`.
        order_id: i64,
    },
    /// Reconcile an order by audit row id.
    RecheckOrder {
        /// Audit row id returned by `place_order`.
        order_id: i64,
    },
    /// List open positions.
    ListPositions,
    /// Query margin figures.
    QueryMargin,
    /// Query profit and loss.
    QueryProfitLoss,
    /// List executed trades.
    ListTrades,
    /// List settlements.
    ListSettlements,
    /// List the contract catalog.
    ListSymbols,
    /// Detail for one symbol.
    SymbolInfo {
        /// Client-facing symbol.
        symbol: String,
    },
    /// One-shot market snapshot.
    SymbolSnapshot {
        /// Client-facing symbol.
        symbol: String,
    },
    /// Query upstream usage counters.
    QueryUsage,
    /// Join a quote subscription.
    SubscribeQuote {
        /// Client-facing symbol.
        symbol: String,
    },
    /// Leave a quote subscription.
    UnsubscribeQuote {
        /// Client-facing symbol.
        symbol: String,
    },
}

impl Command {
    /// The kind this command dispatches on.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::PlaceOrder(_) => CommandKind::PlaceOrder,
            Self::CancelOrder { .. } => CommandKind::CancelOrder,
            Self::RecheckOrder { .. } => CommandKind::RecheckOrder,
            Self::ListPositions => CommandKind::ListPositions,
            Self::QueryMargin => CommandKind::QueryMargin,
            Self::QueryProfitLoss => CommandKind::QueryProfitLoss,
            Self::ListTrades => CommandKind::ListTrades,
            Self::ListSettlements => CommandKind::ListSettlements,
            Self::ListSymbols => CommandKind::ListSymbols,
            Self::SymbolInfo { .. } => CommandKind::SymbolInfo,
            Self::SymbolSnapshot { .. } => CommandKind::SymbolSnapshot,
            Self::QueryUsage => CommandKind::QueryUsage,
            Self::SubscribeQuote { .. } => CommandKind::SubscribeQuote,
            Self::UnsubscribeQuote { .. } => CommandKind::UnsubscribeQuote,
        }
    }
}

// =============================================================================
// Request Envelope
// =============================================================================

fn default_simulation() -> bool {
    true
}

/// A command envelope enqueued exactly once on the work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Globally unique request id.
    pub request_id: RequestId,
    /// Command kind and payload.
    #[serde(flatten)]
    pub command: Command,
    /// Whether the command targets the simulation account.
    #[serde(default = "default_simulation")]
    pub simulation: bool,
    /// Submission timestamp.
    pub submitted_at: DateTime<Utc>,
    /// How long the reply slot stays readable after completion.
    pub response_ttl_ms: u64,
}

// =============================================================================
// Response
// =============================================================================

/// Outcome of a consumed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// The command succeeded.
    Ok,
    /// The command failed; `message` explains why.
    Failed,
    /// The command required no action (e.g. exit with nothing to exit).
    NoAction,
}

impl ResponseStatus {
    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::NoAction => "no_action",
        }
    }
}

/// The reply written (at most once) to a request's reply slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// The request this answers.
    pub request_id: RequestId,
    /// Outcome.
    pub status: ResponseStatus,
    /// Command-specific result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Human-readable explanation on failure or no-action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failure classification, present only when `status` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    /// Whether the caller may retry the same command.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

impl CommandResponse {
    /// Successful response carrying a serialized result payload.
    #[must_use]
    pub fn ok(request_id: impl Into<RequestId>, data: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Ok,
            data: Some(data),
            message: None,
            error: None,
            retryable: false,
        }
    }

    /// Failed response with a classification and message.
    #[must_use]
    pub fn failed(
        request_id: impl Into<RequestId>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Failed,
            data: None,
            message: Some(message.into()),
            error: Some(kind),
            retryable: kind.retryable(),
        }
    }

    /// No-action response with an explanation.
    #[must_use]
    pub fn no_action(request_id: impl Into<RequestId>, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::NoAction,
            data: None,
            message: Some(message.into()),
            error: None,
            retryable: false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
