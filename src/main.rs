//! Trading Bridge Binary
//!
//! Starts the single-session brokerage bridge.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin trading-bridge
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `TRADING_API_KEY`: upstream API key
//! - `TRADING_SECRET_KEY`: upstream secret key
//!
//! ## Optional
//! - `TRADING_MODE`: simulation | live (default: simulation)
//! - `AUTH_KEY`: shared secret for the HTTP surface (default: changeme)
//! - `BRIDGE_HTTP_PORT`: HTTP/WebSocket port (default: 8080)
//! - `BRIDGE_QUEUE_DEPTH`: work queue depth (default: 256)
//! - `BRIDGE_RESPONSE_TTL_SECS`: reply slot TTL (default: 30)
//! - `BRIDGE_AWAIT_TIMEOUT_SECS`: facade reply wait (default: 10)
//! - `SUPPORTED_FUTURES` / `SUPPORTED_OPTIONS`: product families to serve
//! - `RUST_LOG`: log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use trading_bridge::audit::{AuditStore, InMemoryAuditStore};
use trading_bridge::broker::{sim::SimUpstream, UpstreamPort};
use trading_bridge::bus::{BusConfig, CorrelationBus};
use trading_bridge::config::BridgeConfig;
use trading_bridge::hub::StreamingHub;
use trading_bridge::quote::QuoteManager;
use trading_bridge::server::{create_router, AppState};
use trading_bridge::session::SessionManager;
use trading_bridge::worker::Worker;
use trading_bridge::{metrics, telemetry};

/// How often expired reply slots are swept.
const REPLY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();
    telemetry::init();

    tracing::info!("starting trading bridge");
    let _metrics_handle = metrics::init_metrics();

    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration invalid");
            return Err(err.into());
        }
    };
    log_config(&config);

    let shutdown = CancellationToken::new();

    // The bundled upstream adapter is the simulated session; a production
    // deployment wires a real connector here.
    let upstream: Arc<dyn UpstreamPort> = Arc::new(SimUpstream::new());
    if config.mode.is_live() {
        tracing::warn!("live mode selected with the simulated upstream adapter");
    }

    let (bus, work_queue) = CorrelationBus::new(BusConfig::from(&config.bus));
    let bus = Arc::new(bus);

    let session = Arc::new(SessionManager::new(
        Arc::clone(&upstream),
        config.mode,
        config.session.clone(),
        config.supported_families(),
    ));

    let quotes = Arc::new(QuoteManager::new(
        Arc::clone(&upstream),
        Arc::clone(&bus),
        Arc::clone(&session),
    ));
    let audit: Arc<dyn AuditStore> = Arc::new(InMemoryAuditStore::new());

    // Bridge upstream push callbacks into the consumer task's channel.
    let (quote_tx, quote_rx) = mpsc::unbounded_channel();
    upstream.install_quote_sink(quote_tx);
    quotes.spawn_consumer(quote_rx, shutdown.clone());

    let worker = Arc::new(Worker::new(
        Arc::clone(&bus),
        Arc::clone(&session),
        Arc::clone(&upstream),
        Arc::clone(&quotes),
        Arc::clone(&audit),
    ));
    tokio::spawn(Arc::clone(&worker).run(work_queue, shutdown.clone()));

    // Establish the session in the background; commands submitted before it
    // is ready fail with a retryable marker.
    let establishing = Arc::clone(&session);
    tokio::spawn(async move {
        establishing.establish().await;
    });

    let hub = Arc::new(StreamingHub::new(
        Arc::clone(&bus),
        config.hub.clone(),
        config.mode.is_simulation(),
    ));
    hub.spawn_listener(shutdown.clone());

    spawn_reply_sweeper(Arc::clone(&bus), shutdown.clone());

    let state = AppState {
        bus: Arc::clone(&bus),
        hub: Arc::clone(&hub),
        session: Arc::clone(&session),
        auth_key: Arc::new(config.auth_key.clone()),
        default_simulation: config.mode.is_simulation(),
        await_timeout: config.bus.await_timeout,
    };
    let router = create_router(state);

    let addr = format!("0.0.0.0:{}", config.server.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "http server listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            await_shutdown().await;
            serve_shutdown.cancel();
        })
        .await?;

    // Retire cleanly: drop subscriptions, free the upstream slot.
    quotes.cleanup().await;
    session.shutdown().await;

    tracing::info!("trading bridge stopped");
    Ok(())
}

/// Load `.env` from the current or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &BridgeConfig) {
    tracing::info!(
        mode = config.mode.as_str(),
        http_port = config.server.http_port,
        queue_depth = config.bus.queue_depth,
        response_ttl_secs = config.bus.response_ttl.as_secs(),
        supported_futures = ?config.supported_futures,
        supported_options = ?config.supported_options,
        "configuration loaded"
    );
}

/// Periodically drop expired reply slots.
fn spawn_reply_sweeper(bus: Arc<CorrelationBus>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REPLY_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let purged = bus.purge_expired();
                    if purged > 0 {
                        tracing::debug!(purged, "expired reply slots dropped");
                    }
                }
            }
        }
    });
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }
}
