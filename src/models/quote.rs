//! Normalized Quote Frames
//!
//! The shape published on `quote.<alias>` bus channels and delivered to
//! streaming clients. `symbol` is always the client-facing alias the
//! subscriber asked for, never the raw exchange code; `code` carries the
//! exchange code for reference. Tick frames and bid/ask frames share the
//! struct and are discriminated by `quote_type`.

use serde::{Deserialize, Serialize};

use crate::broker::{BidAskData, SnapshotReport, TickData};

/// Channel namespace prefix for quote publications.
pub const QUOTE_CHANNEL_PREFIX: &str = "quote.";

/// Build the bus channel name for an alias.
#[must_use]
pub fn quote_channel(alias: &str) -> String {
    format!("{QUOTE_CHANNEL_PREFIX}{alias}")
}

/// Extract the alias from a quote channel name.
#[must_use]
pub fn alias_from_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix(QUOTE_CHANNEL_PREFIX)
}

/// Discriminates the two frame flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuoteKind {
    /// A trade tick with last price and volumes.
    #[serde(rename = "tick")]
    Tick,
    /// A best bid/ask update.
    #[serde(rename = "bidask")]
    BidAsk,
}

/// A normalized quote update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteFrame {
    /// Client-facing alias the subscriber used.
    pub symbol: String,
    /// Upstream exchange code the update arrived under.
    pub code: String,
    /// Frame flavor.
    pub quote_type: QuoteKind,
    /// Last traded price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close: Option<f64>,
    /// Session open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<f64>,
    /// Session high.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    /// Session low.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    /// Change versus reference price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_price: Option<f64>,
    /// Change percentage versus reference price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_rate: Option<f64>,
    /// Last tick volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<i64>,
    /// Cumulative session volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_volume: Option<i64>,
    /// Best bid price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_price: Option<f64>,
    /// Best ask price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_price: Option<f64>,
    /// Best bid volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_volume: Option<i64>,
    /// Best ask volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_volume: Option<i64>,
    /// Upstream timestamp in milliseconds.
    pub timestamp: i64,
}

impl QuoteFrame {
    /// Normalize an upstream trade tick for `alias`.
    #[must_use]
    pub fn tick(alias: &str, code: &str, tick: &TickData) -> Self {
        Self {
            symbol: alias.to_string(),
            code: code.to_string(),
            quote_type: QuoteKind::Tick,
            close: Some(tick.close),
            open: Some(tick.open),
            high: Some(tick.high),
            low: Some(tick.low),
            change_price: Some(tick.change_price),
            change_rate: Some(tick.change_rate),
            volume: Some(tick.volume),
            total_volume: Some(tick.total_volume),
            bid_price: None,
            ask_price: None,
            bid_volume: None,
            ask_volume: None,
            timestamp: tick.ts,
        }
    }

    /// Normalize an upstream best bid/ask update for `alias`.
    #[must_use]
    pub fn bid_ask(alias: &str, code: &str, bid_ask: &BidAskData) -> Self {
        Self {
            symbol: alias.to_string(),
            code: code.to_string(),
            quote_type: QuoteKind::BidAsk,
            close: None,
            open: None,
            high: None,
            low: None,
            change_price: None,
            change_rate: None,
            volume: None,
            total_volume: None,
            bid_price: Some(bid_ask.bid_price),
            ask_price: Some(bid_ask.ask_price),
            bid_volume: Some(bid_ask.bid_volume),
            ask_volume: Some(bid_ask.ask_volume),
            timestamp: bid_ask.ts,
        }
    }

    /// Shape a one-shot snapshot like a streamed tick with bid/ask attached.
    #[must_use]
    pub fn snapshot(alias: &str, report: &SnapshotReport) -> Self {
        Self {
            symbol: alias.to_string(),
            code: report.code.clone(),
            quote_type: QuoteKind::Tick,
            close: Some(report.close),
            open: Some(report.open),
            high: Some(report.high),
            low: Some(report.low),
            change_price: Some(report.change_price),
            change_rate: Some(report.change_rate),
            volume: Some(report.volume),
            total_volume: Some(report.total_volume),
            bid_price: Some(report.buy_price),
            ask_price: Some(report.sell_price),
            bid_volume: Some(report.buy_volume),
            ask_volume: Some(report.sell_volume),
            timestamp: report.ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tick() -> TickData {
        TickData {
            close: 17_512.0,
            open: 17_480.0,
            high: 17_530.0,
            low: 17_455.0,
            change_price: 32.0,
            change_rate: 0.18,
            volume: 3,
            total_volume: 45_120,
            ts: 1_767_571_200_000,
        }
    }

    #[test]
    fn channel_name_round_trips() {
        let channel = quote_channel("TMFR1");
        assert_eq!(channel, "quote.TMFR1");
        assert_eq!(alias_from_channel(&channel), Some("TMFR1"));
        assert_eq!(alias_from_channel("orders.TMFR1"), None);
    }

    #[test]
    fn tick_frame_carries_alias_not_code() {
        let frame = QuoteFrame::tick("TMFR1", "TMFB6", &sample_tick());
        assert_eq!(frame.symbol, "TMFR1");
        assert_eq!(frame.code, "TMFB6");
        assert_eq!(frame.quote_type, QuoteKind::Tick);
        assert_eq!(frame.close, Some(17_512.0));
        assert!(frame.bid_price.is_none());
    }

    #[test]
    fn bid_ask_frame_omits_tick_fields() {
        let bid_ask = BidAskData {
            bid_price: 17_510.0,
            ask_price: 17_512.0,
            bid_volume: 12,
            ask_volume: 8,
            ts: 1_767_571_200_500,
        };
        let frame = QuoteFrame::bid_ask("TMFR1", "TMFB6", &bid_ask);

        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["quote_type"], "bidask");
        assert_eq!(json["bid_price"], 17_510.0);
        assert!(json.get("close").is_none());
        assert!(json.get("volume").is_none());
    }

    #[test]
    fn tick_wire_shape_uses_tick_tag() {
        let frame = QuoteFrame::tick("MXFR1", "MXFB6", &sample_tick());
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["quote_type"], "tick");
        assert!(json.get("bid_price").is_none());
    }
}
