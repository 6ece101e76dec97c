#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::too_many_lines,
        clippy::default_trait_access
    )
)]

//! Trading Bridge - Single-Session Brokerage Gateway
//!
//! Brokers HTTP and browser-facing requests to a single upstream brokerage
//! session that refuses concurrent logins. Three coordination pieces make
//! this possible:
//!
//! - a **correlation bus** that turns synchronous API calls into correlated
//!   asynchronous jobs consumed by exactly one worker;
//! - a **single-session worker** that owns the sole upstream session,
//!   processes jobs serially, and re-establishes the session on token or
//!   connection failure;
//! - a **quote fan-out pipeline** that converts upstream push callbacks into
//!   per-symbol streams shared by many browser sockets.
//!
//! # Data Flow
//!
//! ```text
//! HTTP facade ──► bus queue ──► dispatcher ──► handler ──► upstream
//!                                   │
//!                             reply slot ◄── response
//!
//! upstream callback ──► quote manager ──► quote.<alias> ──► streaming hub ──► sockets
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Order audit store interface and in-memory adapter.
pub mod audit;

/// Upstream brokerage port, error classification, and simulated adapter.
pub mod broker;

/// Correlation bus: work queue, reply slots, quote pub/sub.
pub mod bus;

/// Environment-driven configuration.
pub mod config;

/// Response error taxonomy.
pub mod error;

/// Streaming hub for browser WebSocket clients.
pub mod hub;

/// Prometheus metrics.
pub mod metrics;

/// Wire types: command envelopes, responses, quote frames.
pub mod models;

/// Quote subscription manager and fan-out pipeline.
pub mod quote;

/// HTTP facade routes.
pub mod server;

/// Worker session lifecycle and contract catalog.
pub mod session;

/// Tracing setup.
pub mod telemetry;

/// Command dispatcher and handlers.
pub mod worker;

// =============================================================================
// Re-exports
// =============================================================================

pub use audit::{AuditStore, InMemoryAuditStore, OrderAuditRecord};
pub use broker::{sim::SimUpstream, UpstreamError, UpstreamPort};
pub use bus::{BusConfig, BusError, CorrelationBus, WorkQueue};
pub use config::{BridgeConfig, ConfigError, Credentials, TradingMode};
pub use error::{ErrorKind, ResponseError};
pub use hub::StreamingHub;
pub use models::{
    Command, CommandRequest, CommandResponse, OrderCommand, QuoteFrame, ResponseStatus,
};
pub use quote::QuoteManager;
pub use server::{create_router, AppState};
pub use session::{ContractCatalog, SessionManager, SessionState};
pub use worker::Worker;
