//! HTTP Facade
//!
//! Thin translation layer: each route validates its input, builds a command
//! envelope, submits it on the bus, and awaits the correlated reply. The
//! facade holds no state beyond the shared bus client and the auth secret.
//!
//! Account and order routes require the shared secret in `X-Auth-Key`;
//! catalog routes, health, and metrics are open.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::WebSocketUpgrade,
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::bus::{BusError, CorrelationBus};
use crate::config::TradingMode;
use crate::error::ErrorKind;
use crate::hub::StreamingHub;
use crate::models::{Command, CommandResponse, OrderCommand, ResponseStatus};
use crate::session::{SessionManager, SessionState};

/// Shared state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    /// Correlation bus client.
    pub bus: Arc<CorrelationBus>,
    /// Streaming hub for `/ws/quotes`.
    pub hub: Arc<StreamingHub>,
    /// Session manager, for liveness reporting.
    pub session: Arc<SessionManager>,
    /// Shared secret expected in `X-Auth-Key`.
    pub auth_key: Arc<String>,
    /// Default `simulation` flag when the query omits it.
    pub default_simulation: bool,
    /// How long routes wait for a correlated reply.
    pub await_timeout: Duration,
}

/// Create the axum router with all endpoints.
#[must_use]
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/order", post(place_order))
        .route("/orders/{order_id}/recheck", post(recheck_order))
        .route("/orders/{order_id}/cancel", post(cancel_order))
        .route("/positions", get(list_positions))
        .route("/margin", get(query_margin))
        .route("/profit-loss", get(query_profit_loss))
        .route("/trades", get(list_trades))
        .route("/settlements", get(list_settlements))
        .route("/usage", get(query_usage))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(protected)
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/symbols", get(list_symbols))
        .route("/symbols/{symbol}", get(symbol_info))
        .route("/symbols/{symbol}/snapshot", get(symbol_snapshot))
        .route("/ws/quotes", get(ws_quotes))
        .with_state(state)
}

// =============================================================================
// Auth
// =============================================================================

async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get("x-auth-key")
        .and_then(|value| value.to_str().ok());
    if provided != Some(state.auth_key.as_str()) {
        return Err(ApiError::unauthorized());
    }
    Ok(next.run(request).await)
}

// =============================================================================
// Query Parameters
// =============================================================================

/// Account-mode selector shared by every command route.
#[derive(Debug, Deserialize)]
struct ModeQuery {
    simulation: Option<bool>,
}

impl ModeQuery {
    fn resolve(&self, state: &AppState) -> bool {
        self.simulation.unwrap_or(state.default_simulation)
    }
}

// =============================================================================
// Command Routes
// =============================================================================

async fn submit_and_wait(
    state: &AppState,
    command: Command,
    simulation: bool,
) -> Result<Json<CommandResponse>, ApiError> {
    let request_id = state
        .bus
        .submit(command, simulation)
        .map_err(|err| ApiError::from_bus(&err))?;

    let response = state
        .bus
        .await_response(&request_id, state.await_timeout)
        .await
        .map_err(|err| ApiError::from_bus(&err))?;

    if response.status == ResponseStatus::Failed {
        return Err(ApiError::from_failure(response));
    }
    Ok(Json(response))
}

async fn place_order(
    State(state): State<AppState>,
    Query(mode): Query<ModeQuery>,
    Json(order): Json<OrderCommand>,
) -> Result<Json<CommandResponse>, ApiError> {
    let simulation = mode.resolve(&state);
    tracing::info!(
        symbol = %order.symbol,
        action = %order.action,
        quantity = order.quantity,
        simulation,
        "order received"
    );
    submit_and_wait(&state, Command::PlaceOrder(order), simulation).await
}

async fn recheck_order(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
    Query(mode): Query<ModeQuery>,
) -> Result<Json<CommandResponse>, ApiError> {
    let simulation = mode.resolve(&state);
    submit_and_wait(&state, Command::RecheckOrder { order_id }, simulation).await
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
    Query(mode): Query<ModeQuery>,
) -> Result<Json<CommandResponse>, ApiError> {
    let simulation = mode.resolve(&state);
    submit_and_wait(&state, Command::CancelOrder { order_id }, simulation).await
}

async fn list_positions(
    State(state): State<AppState>,
    Query(mode): Query<ModeQuery>,
) -> Result<Json<CommandResponse>, ApiError> {
    let simulation = mode.resolve(&state);
    submit_and_wait(&state, Command::ListPositions, simulation).await
}

async fn query_margin(
    State(state): State<AppState>,
    Query(mode): Query<ModeQuery>,
) -> Result<Json<CommandResponse>, ApiError> {
    let simulation = mode.resolve(&state);
    submit_and_wait(&state, Command::QueryMargin, simulation).await
}

async fn query_profit_loss(
    State(state): State<AppState>,
    Query(mode): Query<ModeQuery>,
) -> Result<Json<CommandResponse>, ApiError> {
    let simulation = mode.resolve(&state);
    submit_and_wait(&state, Command::QueryProfitLoss, simulation).await
}

async fn list_trades(
    State(state): State<AppState>,
    Query(mode): Query<ModeQuery>,
) -> Result<Json<CommandResponse>, ApiError> {
    let simulation = mode.resolve(&state);
    submit_and_wait(&state, Command::ListTrades, simulation).await
}

async fn list_settlements(
    State(state): State<AppState>,
    Query(mode): Query<ModeQuery>,
) -> Result<Json<CommandResponse>, ApiError> {
    let simulation = mode.resolve(&state);
    submit_and_wait(&state, Command::ListSettlements, simulation).await
}

async fn query_usage(
    State(state): State<AppState>,
    Query(mode): Query<ModeQuery>,
) -> Result<Json<CommandResponse>, ApiError> {
    let simulation = mode.resolve(&state);
    submit_and_wait(&state, Command::QueryUsage, simulation).await
}

async fn list_symbols(
    State(state): State<AppState>,
    Query(mode): Query<ModeQuery>,
) -> Result<Json<CommandResponse>, ApiError> {
    let simulation = mode.resolve(&state);
    submit_and_wait(&state, Command::ListSymbols, simulation).await
}

async fn symbol_info(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(mode): Query<ModeQuery>,
) -> Result<Json<CommandResponse>, ApiError> {
    let simulation = mode.resolve(&state);
    submit_and_wait(&state, Command::SymbolInfo { symbol }, simulation).await
}

async fn symbol_snapshot(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(mode): Query<ModeQuery>,
) -> Result<Json<CommandResponse>, ApiError> {
    let simulation = mode.resolve(&state);
    submit_and_wait(&state, Command::SymbolSnapshot { symbol }, simulation).await
}

// =============================================================================
// Streaming, Health, Metrics
// =============================================================================

async fn ws_quotes(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| hub.serve_socket(socket))
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    session: SessionState,
    mode: TradingMode,
    streaming_clients: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let session = state.session.state();
    Json(HealthResponse {
        status: if session == SessionState::Ready {
            "ok"
        } else {
            "degraded"
        },
        session,
        mode: state.session.mode(),
        streaming_clients: state.hub.connection_count(),
    })
}

async fn render_metrics() -> Response {
    crate::metrics::get_metrics_handle().map_or_else(
        || (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
        |handle| handle.render().into_response(),
    )
}

// =============================================================================
// Errors
// =============================================================================

/// Error body returned by every failing route.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Error classification.
    pub error: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the caller may retry the same request.
    pub retryable: bool,
    /// The correlated request id, when one was assigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// HTTP error with a structured body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: ErrorBody {
                error: "unauthorized".to_string(),
                message: "invalid authentication key".to_string(),
                retryable: false,
                request_id: None,
            },
        }
    }

    fn from_bus(err: &BusError) -> Self {
        let (status, error, retryable, request_id) = match err {
            BusError::QueueFull(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                "queue_full",
                true,
                None,
            ),
            BusError::WorkerGone => (
                StatusCode::SERVICE_UNAVAILABLE,
                "worker_unavailable",
                true,
                None,
            ),
            BusError::TimedOut(id) => (
                StatusCode::GATEWAY_TIMEOUT,
                "timed_out",
                false,
                Some(id.clone()),
            ),
            BusError::AlreadyAwaited(id) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "reply_contention",
                false,
                Some(id.clone()),
            ),
        };
        let message = match err {
            // The outcome is unknown; the command may still have executed.
            BusError::TimedOut(id) => format!(
                "no reply within the wait budget for {id}; the command may still \
                 complete, use recheck to reconcile orders"
            ),
            other => other.to_string(),
        };
        Self {
            status,
            body: ErrorBody {
                error: error.to_string(),
                message,
                retryable,
                request_id,
            },
        }
    }

    fn from_failure(response: CommandResponse) -> Self {
        let status = match response.error {
            Some(ErrorKind::Validation | ErrorKind::UpstreamRefused) => StatusCode::BAD_REQUEST,
            Some(ErrorKind::NotFound) => StatusCode::NOT_FOUND,
            Some(ErrorKind::SessionNotReady | ErrorKind::UpstreamTransient) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Some(ErrorKind::Internal) | None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorBody {
                error: response
                    .error
                    .map_or_else(|| "failed".to_string(), |kind| kind.as_str().to_string()),
                message: response
                    .message
                    .unwrap_or_else(|| "command failed".to_string()),
                retryable: response.retryable,
                request_id: Some(response.request_id),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditStore;
    use crate::broker::sim::SimUpstream;
    use crate::broker::UpstreamPort;
    use crate::bus::BusConfig;
    use crate::config::{HubSettings, SessionSettings};
    use crate::quote::QuoteManager;
    use crate::worker::Worker;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    async fn test_app() -> Router {
        let sim = Arc::new(SimUpstream::new());
        let upstream: Arc<dyn UpstreamPort> = Arc::clone(&sim) as Arc<dyn UpstreamPort>;

        let (bus, queue) = CorrelationBus::new(BusConfig::default());
        let bus = Arc::new(bus);

        let session = Arc::new(SessionManager::new(
            Arc::clone(&upstream),
            TradingMode::Simulation,
            SessionSettings::default(),
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
            audit,
        ));
        tokio::spawn(Arc::clone(&worker).run(queue, CancellationToken::new()));

        let hub = Arc::new(StreamingHub::new(
            Arc::clone(&bus),
            HubSettings::default(),
            true,
        ));

        create_router(AppState {
            bus,
            hub,
            session,
            auth_key: Arc::new("test-key".to_string()),
            default_simulation: true,
            await_timeout: Duration::from_secs(2),
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ready_session() {
        let app = test_app().await;
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["session"], "ready");
        assert_eq!(json["mode"], "simulation");
    }

    #[tokio::test]
    async fn protected_route_requires_auth_key() {
        let app = test_app().await;

        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/positions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/positions")
                    .header("X-Auth-Key", "test-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn symbols_listing_is_open_and_grouped() {
        let app = test_app().await;
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/symbols")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["data"]["families"]["TMF"].is_array());
    }

    #[tokio::test]
    async fn unknown_symbol_detail_is_404() {
        let app = test_app().await;
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/symbols/NOPE999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = body_json(response).await;
        assert_eq!(json["error"], "not_found");
    }

    #[tokio::test]
    async fn order_round_trips_through_the_bus() {
        let app = test_app().await;
        let body = serde_json::json!({
            "action": "long_entry",
            "symbol": "TMFR1",
            "quantity": 1
        });

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/order")
                    .header("X-Auth-Key", "test-key")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["data"]["order_id"].is_i64());
        assert_eq!(json["data"]["symbol"], "TMFR1");
    }

    #[tokio::test]
    async fn invalid_order_is_400_with_validation_kind() {
        let app = test_app().await;
        let body = serde_json::json!({
            "action": "long_entry",
            "symbol": "NOPE999",
            "quantity": 1
        });

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/order")
                    .header("X-Auth-Key", "test-key")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert_eq!(json["error"], "validation");
        assert_eq!(json["retryable"], false);
    }
}
