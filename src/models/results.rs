//! Result Schemas
//!
//! Typed payloads serialized into the `data` field of a [`CommandResponse`].
//! Empty upstream responses normalize to empty collections, never to errors.
//!
//! [`CommandResponse`]: super::CommandResponse

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::broker::{
    Deal, MarginReport, PositionRecord, ProfitLossReport, SettlementRecord, TradeRecord,
    UsageReport,
};
use crate::models::{InternalOrderStatus, OrderAction, QuoteFrame};

/// Result of a successful `place_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    /// Audit row id; the handle for recheck and cancel.
    pub order_id: i64,
    /// Upstream order identifier.
    pub upstream_order_id: String,
    /// Status at submission.
    pub status: InternalOrderStatus,
    /// Symbol the caller used.
    pub symbol: String,
    /// Exchange code the order went out under.
    pub exchange_code: String,
    /// Directional intent.
    pub action: OrderAction,
    /// Quantity actually submitted (may differ from the request on reversal).
    pub quantity: u32,
}

/// One execution reported back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealInfo {
    /// Deal sequence identifier.
    pub seq: String,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity.
    pub quantity: u32,
    /// Execution timestamp in milliseconds.
    pub ts: i64,
}

impl From<&Deal> for DealInfo {
    fn from(deal: &Deal) -> Self {
        Self {
            seq: deal.seq.clone(),
            price: deal.price,
            quantity: deal.quantity,
            ts: deal.ts,
        }
    }
}

/// Result of `recheck_order`: the reconciled delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecheckResult {
    /// Audit row id.
    pub order_id: i64,
    /// Status before reconciliation.
    pub previous_status: InternalOrderStatus,
    /// Status after reconciliation.
    pub current_status: InternalOrderStatus,
    /// Filled quantity.
    pub fill_quantity: u32,
    /// Average fill price, if any fills.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<Decimal>,
    /// Cancelled quantity.
    pub cancel_quantity: u32,
    /// Individual executions.
    pub deals: Vec<DealInfo>,
}

/// Result of `cancel_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResult {
    /// Audit row id.
    pub order_id: i64,
    /// Status after the cancel request.
    pub status: InternalOrderStatus,
    /// Cancelled quantity.
    pub cancel_quantity: u32,
}

/// One open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    /// Exchange code of the contract.
    pub code: String,
    /// `Buy` or `Sell`.
    pub direction: String,
    /// Open quantity.
    pub quantity: u32,
    /// Average entry price.
    pub price: Decimal,
    /// Last traded price.
    pub last_price: Decimal,
    /// Unrealized profit and loss.
    pub pnl: Decimal,
}

impl From<&PositionRecord> for PositionInfo {
    fn from(record: &PositionRecord) -> Self {
        Self {
            code: record.code.clone(),
            direction: format!("{:?}", record.direction),
            quantity: record.quantity,
            price: record.price,
            last_price: record.last_price,
            pnl: record.pnl,
        }
    }
}

/// Result of `list_positions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionsResult {
    /// Open positions; empty when flat.
    pub positions: Vec<PositionInfo>,
    /// Number of positions.
    pub count: usize,
}

impl PositionsResult {
    /// Build from upstream records.
    #[must_use]
    pub fn from_records(records: &[PositionRecord]) -> Self {
        let positions: Vec<PositionInfo> = records.iter().map(PositionInfo::from).collect();
        let count = positions.len();
        Self { positions, count }
    }
}

/// Result of `query_margin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginResult {
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

impl From<&MarginReport> for MarginResult {
    fn from(report: &MarginReport) -> Self {
        Self {
            yesterday_balance: report.yesterday_balance,
            today_balance: report.today_balance,
            available_margin: report.available_margin,
            initial_margin: report.initial_margin,
            maintenance_margin: report.maintenance_margin,
            margin_call: report.margin_call,
            equity: report.equity,
            risk_indicator: report.risk_indicator,
            fee: report.fee,
            tax: report.tax,
        }
    }
}

/// Result of `query_profit_loss`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitLossResult {
    /// Realized profit and loss.
    pub realized_pnl: Decimal,
    /// Unrealized profit and loss.
    pub unrealized_pnl: Decimal,
    /// Sum of both.
    pub total_pnl: Decimal,
}

impl From<&ProfitLossReport> for ProfitLossResult {
    fn from(report: &ProfitLossReport) -> Self {
        Self {
            realized_pnl: report.realized_pnl,
            unrealized_pnl: report.unrealized_pnl,
            total_pnl: report.total_pnl,
        }
    }
}

/// One executed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeInfo {
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
    /// `Buy` or `Sell`.
    pub action: String,
    /// Execution timestamp in milliseconds.
    pub ts: i64,
}

/// Result of `list_trades`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradesResult {
    /// Executed trades; empty when none.
    pub trades: Vec<TradeInfo>,
    /// Number of trades.
    pub count: usize,
}

impl TradesResult {
    /// Build from upstream records.
    #[must_use]
    pub fn from_records(records: &[TradeRecord]) -> Self {
        let trades: Vec<TradeInfo> = records
            .iter()
            .map(|record| TradeInfo {
                code: record.code.clone(),
                order_id: record.order_id.clone(),
                seqno: record.seqno.clone(),
                price: record.price,
                quantity: record.quantity,
                action: format!("{:?}", record.action),
                ts: record.ts,
            })
            .collect();
        let count = trades.len();
        Self { trades, count }
    }
}

/// One settlement record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementInfo {
    /// Settlement date, `YYYY-MM-DD`.
    pub date: String,
    /// Settled amount.
    pub amount: Decimal,
    /// Money settling today.
    pub t_money: Decimal,
    /// Money settling next session.
    pub t1_money: Decimal,
}

/// Result of `list_settlements`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementsResult {
    /// Settlements; empty when none.
    pub settlements: Vec<SettlementInfo>,
    /// Number of settlements.
    pub count: usize,
}

impl SettlementsResult {
    /// Build from upstream records.
    #[must_use]
    pub fn from_records(records: &[SettlementRecord]) -> Self {
        let settlements: Vec<SettlementInfo> = records
            .iter()
            .map(|record| SettlementInfo {
                date: record.date.clone(),
                amount: record.amount,
                t_money: record.t_money,
                t1_money: record.t1_money,
            })
            .collect();
        let count = settlements.len();
        Self { settlements, count }
    }
}

/// Summary of one tradable symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolSummary {
    /// Client-facing symbol.
    pub symbol: String,
    /// Exchange code.
    pub code: String,
    /// Display name.
    pub name: String,
}

/// Result of `list_symbols`, grouped by product family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolsResult {
    /// Symbols keyed by family prefix.
    pub families: BTreeMap<String, Vec<SymbolSummary>>,
    /// Total symbol count.
    pub count: usize,
}

/// Result of `symbol_snapshot`: shaped like a streamed tick.
pub type SnapshotResult = QuoteFrame;

/// Result of `query_usage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageResult {
    /// Concurrent connections counted against the identity.
    pub connections: u32,
    /// Bytes consumed against the data quota.
    pub bytes: u64,
    /// Quota limit in bytes.
    pub limit_bytes: u64,
    /// Bytes remaining before the quota is exhausted.
    pub remaining_bytes: u64,
}

impl From<&UsageReport> for UsageResult {
    fn from(report: &UsageReport) -> Self {
        Self {
            connections: report.connections,
            bytes: report.bytes,
            limit_bytes: report.limit_bytes,
            remaining_bytes: report.limit_bytes.saturating_sub(report.bytes),
        }
    }
}

/// Result of `subscribe_quote` / `unsubscribe_quote`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionResult {
    /// The alias acted on.
    pub symbol: String,
    /// Whether a subscription is active after the command.
    pub subscribed: bool,
    /// Subscriber count for the alias after the command.
    pub refcount: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_positions_normalize_to_empty_collection() {
        let result = PositionsResult::from_records(&[]);
        assert!(result.positions.is_empty());
        assert_eq!(result.count, 0);
    }

    #[test]
    fn usage_remaining_saturates() {
        let report = UsageReport {
            connections: 1,
            bytes: 600,
            limit_bytes: 500,
        };
        let result = UsageResult::from(&report);
        assert_eq!(result.remaining_bytes, 0);
    }

    #[test]
    fn trades_result_preserves_order() {
        use crate::broker::OrderSide;

        let records = vec![
            TradeRecord {
                code: "TMFB6".to_string(),
                order_id: "o-1".to_string(),
                seqno: "1".to_string(),
                price: Decimal::new(17_500, 0),
                quantity: 1,
                action: OrderSide::Buy,
                ts: 10,
            },
            TradeRecord {
                code: "TMFB6".to_string(),
                order_id: "o-2".to_string(),
                seqno: "2".to_string(),
                price: Decimal::new(17_510, 0),
                quantity: 2,
                action: OrderSide::Sell,
                ts: 20,
            },
        ];
        let result = TradesResult::from_records(&records);
        assert_eq!(result.count, 2);
        assert_eq!(result.trades[0].order_id, "o-1");
        assert_eq!(result.trades[1].action, "Sell");
    }
}
