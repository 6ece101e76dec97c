//! Command Round-Trip Integration Tests
//!
//! Drives the real bus, worker, session manager, and simulated upstream
//! end to end: order placement and reconciliation, the no-action gate,
//! and session healing mid-flight.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use trading_bridge::audit::{AuditStore, InMemoryAuditStore};
use trading_bridge::broker::{sim::SimUpstream, UpstreamError, UpstreamPort};
use trading_bridge::bus::{BusConfig, CorrelationBus};
use trading_bridge::config::{SessionSettings, TradingMode};
use trading_bridge::error::ErrorKind;
use trading_bridge::models::{
    Command, CommandResponse, OrderAction, OrderCommand, OrderDuration, PriceType, ResponseStatus,
};
use trading_bridge::quote::QuoteManager;
use trading_bridge::session::{SessionManager, SessionState};
use trading_bridge::worker::Worker;

struct Harness {
    sim: Arc<SimUpstream>,
    bus: Arc<CorrelationBus>,
    session: Arc<SessionManager>,
    audit: Arc<InMemoryAuditStore>,
    _shutdown: CancellationToken,
}

async fn start_harness() -> Harness {
    let sim = Arc::new(SimUpstream::new());
    let upstream: Arc<dyn UpstreamPort> = Arc::clone(&sim) as Arc<dyn UpstreamPort>;

    let (bus, queue) = CorrelationBus::new(BusConfig {
        queue_depth: 32,
        response_ttl: Duration::from_secs(5),
        quote_capacity: 128,
    });
    let bus = Arc::new(bus);

    let session = Arc::new(SessionManager::new(
        Arc::clone(&upstream),
        TradingMode::Simulation,
        SessionSettings {
            reconnect_delay_initial: Duration::from_millis(1),
            reconnect_delay_max: Duration::from_millis(10),
            reconnect_delay_multiplier: 2.0,
            max_login_attempts: 5,
        },
        vec![],
    ));
    assert!(session.establish().await);

    let quotes = Arc::new(QuoteManager::new(
        Arc::clone(&upstream),
        Arc::clone(&bus),
        Arc::clone(&session),
    ));
    let audit = Arc::new(InMemoryAuditStore::new());
    let worker = Arc::new(Worker::new(
        Arc::clone(&bus),
        Arc::clone(&session),
        upstream,
        quotes,
        Arc::clone(&audit) as Arc<dyn AuditStore>,
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&worker).run(queue, shutdown.clone()));

    Harness {
        sim,
        bus,
        session,
        audit,
        _shutdown: shutdown,
    }
}

async fn run_command(harness: &Harness, command: Command) -> CommandResponse {
    let id = harness.bus.submit(command, true).unwrap();
    harness
        .bus
        .await_response(&id, Duration::from_secs(2))
        .await
        .unwrap()
}

fn market_order(action: OrderAction, symbol: &str, quantity: u32) -> Command {
    Command::PlaceOrder(OrderCommand {
        action,
        symbol: symbol.to_string(),
        quantity,
        price: None,
        price_type: PriceType::Market,
        order_type: OrderDuration::ImmediateOrCancel,
    })
}

#[tokio::test]
async fn happy_path_order_then_recheck_converges_to_filled() {
    let harness = start_harness().await;

    let response = run_command(
        &harness,
        market_order(OrderAction::LongEntry, "TMFR1", 1),
    )
    .await;
    assert_eq!(response.status, ResponseStatus::Ok);

    let data = response.data.unwrap();
    let order_id = data["order_id"].as_i64().unwrap();
    assert_eq!(data["symbol"], "TMFR1");
    assert_eq!(data["quantity"], 1);

    // Audit row exists with the same symbol and quantity.
    let row = harness.audit.find(order_id).await.unwrap().unwrap();
    assert_eq!(row.symbol, "TMFR1");
    assert_eq!(row.quantity, 1);
    assert!(row.upstream_order_id.is_some());

    // Reconciliation converges the row to the upstream's terminal status.
    let recheck = run_command(&harness, Command::RecheckOrder { order_id }).await;
    assert_eq!(recheck.status, ResponseStatus::Ok);
    let data = recheck.data.unwrap();
    assert_eq!(data["current_status"], "filled");
    assert_eq!(data["fill_quantity"], 1);

    let row = harness.audit.find(order_id).await.unwrap().unwrap();
    assert_eq!(row.status.as_str(), "filled");
    assert_eq!(row.fill_quantity, 1);
}

#[tokio::test]
async fn spurious_exit_resolves_no_action_without_upstream_order() {
    let harness = start_harness().await;

    // No position in TMFR1 at all.
    let response = run_command(
        &harness,
        market_order(OrderAction::ShortExit, "TMFR1", 2),
    )
    .await;

    assert_eq!(response.status, ResponseStatus::NoAction);
    assert!(response.message.unwrap().contains("no short position"));
    assert_eq!(harness.sim.place_order_calls(), 0);
    assert!(harness.audit.is_empty());
}

#[tokio::test]
async fn exit_with_wrong_sign_resolves_no_action() {
    let harness = start_harness().await;
    harness
        .sim
        .set_position("TMFR1", 3, rust_decimal::Decimal::new(17_500, 0));

    // Long 3, but the caller asks to close a short.
    let response = run_command(
        &harness,
        market_order(OrderAction::ShortExit, "TMFR1", 1),
    )
    .await;

    assert_eq!(response.status, ResponseStatus::NoAction);
    assert_eq!(harness.sim.place_order_calls(), 0);
}

#[tokio::test]
async fn long_exit_closes_the_whole_position() {
    let harness = start_harness().await;
    harness
        .sim
        .set_position("TMFB6", 3, rust_decimal::Decimal::new(17_500, 0));

    let response = run_command(
        &harness,
        market_order(OrderAction::LongExit, "TMF202602", 1),
    )
    .await;

    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.data.unwrap()["quantity"], 3);
    assert_eq!(harness.sim.position("TMFB6"), 0);
}

#[tokio::test]
async fn refused_order_fails_and_leaves_an_audit_trail() {
    let harness = start_harness().await;

    // The position probe succeeds, the submission is refused.
    harness
        .sim
        .inject_fault_after(1, UpstreamError::Refused("insufficient margin".to_string()));

    let response = run_command(
        &harness,
        market_order(OrderAction::LongEntry, "MXFR1", 1),
    )
    .await;

    assert_eq!(response.status, ResponseStatus::Failed);
    assert_eq!(response.error, Some(ErrorKind::UpstreamRefused));
    assert!(!response.retryable);
    assert!(response.message.unwrap().contains("insufficient margin"));

    let rows = harness.audit.all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status.as_str(), "failed");
    assert!(rows[0]
        .failure_message
        .as_deref()
        .unwrap()
        .contains("insufficient margin"));
}

#[tokio::test]
async fn cancel_before_fill_then_recheck_stays_cancelled() {
    let harness = start_harness().await;

    let response = run_command(
        &harness,
        market_order(OrderAction::LongEntry, "TMFR1", 1),
    )
    .await;
    let order_id = response.data.unwrap()["order_id"].as_i64().unwrap();

    let cancel = run_command(&harness, Command::CancelOrder { order_id }).await;
    assert_eq!(cancel.status, ResponseStatus::Ok);
    assert_eq!(cancel.data.unwrap()["status"], "cancelled");

    // A second cancel is a no-op against a terminal order.
    let again = run_command(&harness, Command::CancelOrder { order_id }).await;
    assert_eq!(again.status, ResponseStatus::NoAction);

    let recheck = run_command(&harness, Command::RecheckOrder { order_id }).await;
    assert_eq!(recheck.data.unwrap()["current_status"], "cancelled");
}

#[tokio::test]
async fn session_heals_after_token_expiry_mid_flight() {
    let harness = start_harness().await;

    harness.sim.inject_fault(UpstreamError::TokenExpired);

    // The in-flight request fails with a retryable marker.
    let response = run_command(&harness, Command::ListPositions).await;
    assert_eq!(response.status, ResponseStatus::Failed);
    assert_eq!(response.error, Some(ErrorKind::UpstreamTransient));
    assert!(response.retryable);

    // The worker transitions through reconnecting back to ready.
    let mut watch = harness.session.watch();
    timeout(Duration::from_secs(2), async {
        while *watch.borrow() != SessionState::Ready {
            watch.changed().await.unwrap();
        }
    })
    .await
    .expect("session did not heal in time");

    // Subsequent submissions succeed.
    let response = run_command(&harness, Command::ListPositions).await;
    assert_eq!(response.status, ResponseStatus::Ok);
    assert!(harness.sim.login_calls() >= 2);
}

#[tokio::test]
async fn queries_normalize_empty_upstream_responses() {
    let harness = start_harness().await;

    let response = run_command(&harness, Command::ListSettlements).await;
    assert_eq!(response.status, ResponseStatus::Ok);
    let data = response.data.unwrap();
    assert_eq!(data["count"], 0);
    assert!(data["settlements"].as_array().unwrap().is_empty());

    let response = run_command(&harness, Command::ListPositions).await;
    assert_eq!(response.data.unwrap()["count"], 0);
}

#[tokio::test]
async fn symbol_queries_are_served_from_the_catalog() {
    let harness = start_harness().await;

    let response = run_command(&harness, Command::ListSymbols).await;
    let data = response.data.unwrap();
    assert!(data["count"].as_u64().unwrap() > 0);
    assert!(data["families"]["TMF"]
        .as_array()
        .unwrap()
        .iter()
        .any(|s| s["symbol"] == "TMFR1"));

    let response = run_command(
        &harness,
        Command::SymbolInfo {
            symbol: "TMF202602".to_string(),
        },
    )
    .await;
    assert_eq!(response.data.unwrap()["code"], "TMFB6");

    let response = run_command(
        &harness,
        Command::SymbolSnapshot {
            symbol: "TMFR1".to_string(),
        },
    )
    .await;
    let data = response.data.unwrap();
    assert_eq!(data["symbol"], "TMFR1");
    assert_eq!(data["quote_type"], "tick");
}
