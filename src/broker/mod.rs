//! Upstream Brokerage Port
//!
//! Interface for the one logged-in upstream session the worker owns. The
//! upstream client library itself is a collaborator; this module models only
//! the operations we invoke on it and the push events we expect back. The
//! bundled adapter is the simulated session in [`sim`]; a production
//! deployment links a real connector implementing [`UpstreamPort`].

pub mod sim;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::TradingMode;
use crate::models::{OrderDuration, PriceType, QuoteKind, UpstreamOrderStatus};

// =============================================================================
// Contracts and Accounts
// =============================================================================

/// Product family of a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    /// Futures contract.
    Futures,
    /// Options contract.
    Options,
}

/// One entry of the upstream contract catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractInfo {
    /// Client-facing symbol (e.g. `TMF202602` or the pseudo-symbol `TMFR1`).
    pub symbol: String,
    /// Exchange code the upstream keys data by (e.g. `TMFB6`).
    pub code: String,
    /// Display name.
    pub name: String,
    /// Product family prefix (e.g. `TMF`).
    pub category: String,
    /// Delivery month, `YYYYMM`.
    pub delivery_month: String,
    /// Futures or options.
    pub product: ProductKind,
    /// Contract multiplier.
    pub unit: u32,
    /// Daily limit-up price.
    pub limit_up: Decimal,
    /// Daily limit-down price.
    pub limit_down: Decimal,
    /// Reference price.
    pub reference: Decimal,
}

/// An account usable by the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Upstream account identifier.
    pub account_id: String,
    /// Whether the account is signed for trading.
    pub signed: bool,
}

/// Everything a successful login yields.
#[derive(Debug, Clone)]
pub struct LoginSummary {
    /// Accounts available to the session.
    pub accounts: Vec<AccountInfo>,
    /// The full contract catalog, warm at login.
    pub contracts: Vec<ContractInfo>,
}

// =============================================================================
// Orders
// =============================================================================

/// Side of an upstream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl OrderSide {
    /// The opposite side.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// An order as handed to the upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderTicket {
    /// Buy or sell.
    pub side: OrderSide,
    /// Contract count.
    pub quantity: u32,
    /// Limit price; zero for market orders.
    pub price: Decimal,
    /// Market or limit.
    pub price_type: PriceType,
    /// Order duration.
    pub duration: OrderDuration,
}

/// Acknowledgment returned by the upstream on submission.
#[derive(Debug, Clone)]
pub struct OrderAck {
    /// Upstream order identifier.
    pub order_id: String,
    /// Upstream sequence number.
    pub seqno: String,
    /// Status at acknowledgment time.
    pub status: UpstreamOrderStatus,
}

/// One partial or complete execution of an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    /// Deal sequence identifier.
    pub seq: String,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity.
    pub quantity: u32,
    /// Execution timestamp in milliseconds.
    pub ts: i64,
}

/// The upstream's authoritative view of an order, from a forced refresh.
#[derive(Debug, Clone)]
pub struct OrderStatusReport {
    /// Upstream order identifier.
    pub order_id: String,
    /// Current status.
    pub status: UpstreamOrderStatus,
    /// Quantity originally ordered.
    pub order_quantity: u32,
    /// Quantity filled so far.
    pub deal_quantity: u32,
    /// Quantity cancelled.
    pub cancel_quantity: u32,
    /// Volume-weighted average fill price; zero with no fills.
    pub avg_fill_price: Decimal,
    /// Individual executions.
    pub deals: Vec<Deal>,
    /// Exchange message, if any.
    pub message: String,
}

// =============================================================================
// Account Queries
// =============================================================================

/// One open position.
#[derive(Debug, Clone)]
pub struct PositionRecord {
    /// Exchange code of the contract.
    pub code: String,
    /// Side the position is open on.
    pub direction: OrderSide,
    /// Open quantity, always positive.
    pub quantity: u32,
    /// Average entry price.
    pub price: Decimal,
    /// Last traded price.
    pub last_price: Decimal,
    /// Unrealized profit and loss.
    pub pnl: Decimal,
}

/// Account margin figures.
#[derive(Debug, Clone, Default)]
pub struct MarginReport {
    /// Balance carried from the previous session.
    pub yesterday_balance: Decimal,
    /// Balance for the current session.
    pub today_balance: Decimal,
    /// Margin available for new positions.
    pub available_margin: Decimal,
    /// Initial margin requirement.
    pub initial_margin: Decimal,
    /// Maintenance margin requirement.
    pub maintenance_margin: Decimal,
    /// Outstanding margin call amount.
    pub margin_call: Decimal,
    /// Account equity.
    pub equity: Decimal,
    /// Risk indicator percentage.
    pub risk_indicator: Decimal,
    /// Fees charged this session.
    pub fee: Decimal,
    /// Taxes charged this session.
    pub tax: Decimal,
}

/// Profit and loss summary.
#[derive(Debug, Clone, Default)]
pub struct ProfitLossReport {
    /// Realized profit and loss.
    pub realized_pnl: Decimal,
    /// Unrealized profit and loss.
    pub unrealized_pnl: Decimal,
    /// Sum of realized and unrealized.
    pub total_pnl: Decimal,
}

/// One executed trade.
#[derive(Debug, Clone)]
pub struct TradeRecord {
    /// Exchange code traded.
    pub code: String,
    /// Upstream order identifier.
    pub order_id: String,
    /// Upstream sequence number.
    pub seqno: String,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity.
    pub quantity: u32,
    /// Side.
    pub action: OrderSide,
    /// Execution timestamp in milliseconds.
    pub ts: i64,
}

/// One settlement record.
#[derive(Debug, Clone)]
pub struct SettlementRecord {
    /// Settlement date, `YYYY-MM-DD`.
    pub date: String,
    /// Settled amount.
    pub amount: Decimal,
    /// Money settling today.
    pub t_money: Decimal,
    /// Money settling next session.
    pub t1_money: Decimal,
}

/// Upstream data usage counters.
#[derive(Debug, Clone, Default)]
pub struct UsageReport {
    /// Concurrent connections counted against the identity.
    pub connections: u32,
    /// Bytes consumed against the data quota.
    pub bytes: u64,
    /// Quota limit in bytes.
    pub limit_bytes: u64,
}

/// One-shot market snapshot for a contract.
#[derive(Debug, Clone)]
pub struct SnapshotReport {
    /// Exchange code of the contract.
    pub code: String,
    /// Last traded price.
    pub close: f64,
    /// Session open.
    pub open: f64,
    /// Session high.
    pub high: f64,
    /// Session low.
    pub low: f64,
    /// Best bid price.
    pub buy_price: f64,
    /// Best ask price.
    pub sell_price: f64,
    /// Best bid volume.
    pub buy_volume: i64,
    /// Best ask volume.
    pub sell_volume: i64,
    /// Last tick volume.
    pub volume: i64,
    /// Cumulative session volume.
    pub total_volume: i64,
    /// Change versus reference.
    pub change_price: f64,
    /// Change percentage versus reference.
    pub change_rate: f64,
    /// Snapshot timestamp in milliseconds.
    pub ts: i64,
}

// =============================================================================
// Push Events
// =============================================================================

/// Fields of an upstream trade tick callback.
#[derive(Debug, Clone, PartialEq)]
pub struct TickData {
    /// Last traded price.
    pub close: f64,
    /// Session open.
    pub open: f64,
    /// Session high.
    pub high: f64,
    /// Session low.
    pub low: f64,
    /// Change versus reference.
    pub change_price: f64,
    /// Change percentage versus reference.
    pub change_rate: f64,
    /// Tick volume.
    pub volume: i64,
    /// Cumulative session volume.
    pub total_volume: i64,
    /// Tick timestamp in milliseconds.
    pub ts: i64,
}

/// Fields of an upstream best bid/ask callback.
#[derive(Debug, Clone, PartialEq)]
pub struct BidAskData {
    /// Best bid price.
    pub bid_price: f64,
    /// Best ask price.
    pub ask_price: f64,
    /// Best bid volume.
    pub bid_volume: i64,
    /// Best ask volume.
    pub ask_volume: i64,
    /// Update timestamp in milliseconds.
    pub ts: i64,
}

/// A push event delivered by the upstream, keyed by exchange code.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamQuoteEvent {
    /// A trade tick.
    Tick {
        /// Exchange code the tick arrived under.
        code: String,
        /// Tick fields.
        tick: TickData,
    },
    /// A best bid/ask update.
    BidAsk {
        /// Exchange code the update arrived under.
        code: String,
        /// Bid/ask fields.
        bid_ask: BidAskData,
    },
}

impl UpstreamQuoteEvent {
    /// The exchange code this event is keyed by.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Tick { code, .. } | Self::BidAsk { code, .. } => code,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from the upstream session.
///
/// The transient/business split is an explicit classification table, not a
/// message-substring switch: transient errors drive the session state
/// machine, business errors surface verbatim to the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// Authentication token expired mid-session.
    #[error("authentication token expired")]
    TokenExpired,

    /// The upstream socket dropped.
    #[error("upstream connection lost: {0}")]
    Disconnected(String),

    /// Request signature rejected for timestamp skew.
    #[error("signature timestamp skew")]
    ClockSkew,

    /// An upstream call timed out.
    #[error("upstream call timed out: {0}")]
    Timeout(String),

    /// The upstream is under maintenance.
    #[error("upstream system under maintenance")]
    Maintenance,

    /// Login credentials rejected.
    #[error("login rejected: {0}")]
    LoginRejected(String),

    /// No usable account for the product class.
    #[error("account not usable: {0}")]
    AccountUnusable(String),

    /// The requested contract does not exist upstream.
    #[error("contract not found: {0}")]
    ContractNotFound(String),

    /// The upstream refused the order for a business reason.
    #[error("order refused: {0}")]
    Refused(String),

    /// No order with the given identifier.
    #[error("order not found: {0}")]
    OrderNotFound(String),

    /// A quote subscription was rejected.
    #[error("subscription rejected for {code}: {reason}")]
    SubscriptionRejected {
        /// Exchange code of the rejected subscription.
        code: String,
        /// Upstream reason.
        reason: String,
    },
}

impl UpstreamError {
    /// Whether this error should drive session re-establishment.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TokenExpired
                | Self::Disconnected(_)
                | Self::ClockSkew
                | Self::Timeout(_)
                | Self::Maintenance
        )
    }
}

// =============================================================================
// Port
// =============================================================================

/// Operations the worker invokes on the upstream session.
#[async_trait]
pub trait UpstreamPort: Send + Sync {
    /// Perform a credentialed login and warm the contract catalog.
    async fn login(&self, mode: TradingMode) -> Result<LoginSummary, UpstreamError>;

    /// Log out, freeing the upstream connection slot.
    async fn logout(&self) -> Result<(), UpstreamError>;

    /// Install the channel push callbacks feed into. Called once per session;
    /// the callback's sole job is to push onto this channel.
    fn install_quote_sink(&self, sink: mpsc::UnboundedSender<UpstreamQuoteEvent>);

    /// Place an upstream quote subscription of the given flavor.
    async fn subscribe_quote(
        &self,
        contract: &ContractInfo,
        kind: QuoteKind,
    ) -> Result<(), UpstreamError>;

    /// Remove an upstream quote subscription of the given flavor.
    async fn unsubscribe_quote(
        &self,
        contract: &ContractInfo,
        kind: QuoteKind,
    ) -> Result<(), UpstreamError>;

    /// Submit an order.
    async fn place_order(
        &self,
        contract: &ContractInfo,
        ticket: OrderTicket,
    ) -> Result<OrderAck, UpstreamError>;

    /// Cancel an order and report its refreshed status.
    async fn cancel_order(&self, order_id: &str) -> Result<OrderStatusReport, UpstreamError>;

    /// Force-refresh an order's status.
    async fn order_status(&self, order_id: &str) -> Result<OrderStatusReport, UpstreamError>;

    /// List open positions.
    async fn list_positions(&self) -> Result<Vec<PositionRecord>, UpstreamError>;

    /// Query margin figures.
    async fn margin(&self) -> Result<MarginReport, UpstreamError>;

    /// Query profit and loss.
    async fn profit_loss(&self) -> Result<ProfitLossReport, UpstreamError>;

    /// List executed trades.
    async fn list_trades(&self) -> Result<Vec<TradeRecord>, UpstreamError>;

    /// List settlement records.
    async fn list_settlements(&self) -> Result<Vec<SettlementRecord>, UpstreamError>;

    /// Query data usage counters.
    async fn usage(&self) -> Result<UsageReport, UpstreamError>;

    /// Fetch a one-shot market snapshot.
    async fn snapshot(&self, contract: &ContractInfo) -> Result<SnapshotReport, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_table() {
        assert!(UpstreamError::TokenExpired.is_transient());
        assert!(UpstreamError::Disconnected("reset".into()).is_transient());
        assert!(UpstreamError::ClockSkew.is_transient());
        assert!(UpstreamError::Timeout("place_order".into()).is_transient());
        assert!(UpstreamError::Maintenance.is_transient());

        assert!(!UpstreamError::Refused("insufficient margin".into()).is_transient());
        assert!(!UpstreamError::ContractNotFound("XXX".into()).is_transient());
        assert!(!UpstreamError::LoginRejected("bad key".into()).is_transient());
        assert!(!UpstreamError::OrderNotFound("o-1".into()).is_transient());
    }

    #[test]
    fn quote_event_exposes_code() {
        let event = UpstreamQuoteEvent::BidAsk {
            code: "MXFB6".to_string(),
            bid_ask: BidAskData {
                bid_price: 21_500.0,
                ask_price: 21_501.0,
                bid_volume: 5,
                ask_volume: 7,
                ts: 0,
            },
        };
        assert_eq!(event.code(), "MXFB6");
    }

    #[test]
    fn order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }
}
