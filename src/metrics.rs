//! Prometheus Metrics
//!
//! Application metrics in Prometheus format, rendered at `GET /metrics`.
//!
//! # Metric Categories
//!
//! - **Commands**: processed counts by kind and outcome
//! - **Session**: state gauge, login failures, reconnect incidents
//! - **Quotes**: published and dropped frame counts
//! - **Streaming**: connected clients, active subscriptions

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::models::{CommandKind, QuoteKind, ResponseStatus};
use crate::session::SessionState;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");
            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

fn register_metrics() {
    describe_counter!(
        "bridge_commands_total",
        "Commands processed by the worker, by kind and outcome"
    );
    describe_counter!(
        "bridge_login_failures_total",
        "Failed upstream login attempts"
    );
    describe_counter!(
        "bridge_reconnects_total",
        "Session heal incidents triggered by transient upstream errors"
    );
    describe_counter!(
        "bridge_quotes_published_total",
        "Normalized quote frames published on the bus"
    );
    describe_counter!(
        "bridge_quotes_dropped_total",
        "Upstream callbacks dropped because no alias binding was possible"
    );
    describe_gauge!(
        "bridge_session_state",
        "Session state (0=starting 1=ready 2=reconnecting 3=degraded)"
    );
    describe_gauge!(
        "bridge_quote_subscriptions",
        "Active aliases in the subscription table"
    );
    describe_gauge!(
        "bridge_streaming_clients",
        "Connected browser streaming sockets"
    );
}

/// Record a processed command.
pub fn record_command(kind: CommandKind, status: ResponseStatus) {
    counter!(
        "bridge_commands_total",
        "command" => kind.as_str(),
        "status" => status.as_str()
    )
    .increment(1);
}

/// Record a failed login attempt.
pub fn record_login_failure() {
    counter!("bridge_login_failures_total").increment(1);
}

/// Record a session heal incident.
pub fn record_reconnect() {
    counter!("bridge_reconnects_total").increment(1);
}

/// Record a published quote frame.
pub fn record_quote_published(kind: QuoteKind) {
    let flavor = match kind {
        QuoteKind::Tick => "tick",
        QuoteKind::BidAsk => "bidask",
    };
    counter!("bridge_quotes_published_total", "quote_type" => flavor).increment(1);
}

/// Record a dropped upstream callback.
pub fn record_quote_dropped() {
    counter!("bridge_quotes_dropped_total").increment(1);
}

/// Update the session state gauge.
pub fn set_session_state(state: SessionState) {
    let value = match state {
        SessionState::Starting => 0.0,
        SessionState::Ready => 1.0,
        SessionState::Reconnecting => 2.0,
        SessionState::Degraded => 3.0,
    };
    gauge!("bridge_session_state").set(value);
}

/// Update the active subscription count.
pub fn set_quote_subscriptions(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("bridge_quote_subscriptions").set(count as f64);
}

/// Update the connected streaming client count.
pub fn set_streaming_clients(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("bridge_streaming_clients").set(count as f64);
}
