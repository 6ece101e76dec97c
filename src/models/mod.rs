//! Wire Types
//!
//! Serde-backed shapes shared by the facade, the bus, and the worker:
//! command envelopes, responses, result schemas, quote frames, and the
//! upstream order status vocabulary.

pub mod command;
pub mod quote;
pub mod results;
pub mod status;

pub use command::{
    Command, CommandKind, CommandRequest, CommandResponse, OrderAction, OrderCommand,
    OrderDuration, PriceType, RequestId, ResponseStatus,
};
pub use quote::{alias_from_channel, quote_channel, QuoteFrame, QuoteKind};
pub use results::{
    CancelResult, DealInfo, MarginResult, OrderResult, PositionInfo, PositionsResult,
    ProfitLossResult, RecheckResult, SettlementsResult, SnapshotResult, SubscriptionResult,
    SymbolSummary, SymbolsResult, TradesResult, UsageResult,
};
pub use status::{InternalOrderStatus, UpstreamOrderStatus};
