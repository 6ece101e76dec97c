//! Command Dispatcher
//!
//! The single serial consumer loop that owns the upstream session's use.
//! It blocks for the next request on the work queue, gates on session
//! readiness, routes to the handler for the command kind, and writes exactly
//! one reply per consumed request. Handler failures are normalized into
//! `failed` responses and never propagate out of the loop; transient
//! upstream failures additionally trigger session healing in the background.

pub mod handlers;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::audit::AuditStore;
use crate::broker::UpstreamPort;
use crate::bus::{CorrelationBus, WorkQueue};
use crate::config::TradingMode;
use crate::error::{ErrorKind, ResponseError};
use crate::models::{CommandRequest, CommandResponse};
use crate::quote::QuoteManager;
use crate::session::SessionManager;

/// The single-session worker.
pub struct Worker {
    bus: Arc<CorrelationBus>,
    session: Arc<SessionManager>,
    upstream: Arc<dyn UpstreamPort>,
    quotes: Arc<QuoteManager>,
    audit: Arc<dyn AuditStore>,
    mode: TradingMode,
}

impl Worker {
    /// Assemble a worker around the shared components.
    #[must_use]
    pub fn new(
        bus: Arc<CorrelationBus>,
        session: Arc<SessionManager>,
        upstream: Arc<dyn UpstreamPort>,
        quotes: Arc<QuoteManager>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        let mode = session.mode();
        Self {
            bus,
            session,
            upstream,
            quotes,
            audit,
            mode,
        }
    }

    /// Run the dispatch loop until shutdown or until every submitter is
    /// gone. On shutdown the current handler drains and queued requests are
    /// rejected with a retryable error.
    pub async fn run(self: Arc<Self>, mut queue: WorkQueue, shutdown: CancellationToken) {
        tracing::info!(mode = self.mode.as_str(), "dispatcher started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                maybe = queue.next() => match maybe {
                    Some(request) => self.serve(request).await,
                    None => break,
                }
            }
        }

        for request in queue.drain() {
            let response = ResponseError::new(
                ErrorKind::SessionNotReady,
                "worker shutting down; retry against the next instance",
            )
            .into_response(request.request_id);
            let _ = self.bus.complete(response);
        }
        tracing::info!("dispatcher stopped");
    }

    async fn serve(&self, request: CommandRequest) {
        let request_id = request.request_id.clone();
        let kind = request.command.kind();

        let response = self.dispatch(request).await;

        crate::metrics::record_command(kind, response.status);
        if !self.bus.complete(response) {
            tracing::warn!(request_id = %request_id, "duplicate reply dropped");
        }
    }

    /// Route one request, normalizing every failure into a response.
    async fn dispatch(&self, request: CommandRequest) -> CommandResponse {
        let request_id = request.request_id.clone();

        if request.simulation != self.mode.is_simulation() {
            return ResponseError::validation(format!(
                "worker serves the {} account; request targeted {}",
                self.mode.as_str(),
                if request.simulation { "simulation" } else { "live" },
            ))
            .into_response(request_id);
        }

        let state = self.session.state();
        if !self.session.is_ready() {
            return ResponseError::session_not_ready(state.as_str()).into_response(request_id);
        }

        match self.handle(&request).await {
            Ok(response) => response,
            Err(err) => {
                if err.kind == ErrorKind::UpstreamTransient {
                    self.session.begin_heal();
                }
                tracing::warn!(
                    request_id = %request_id,
                    command = %request.command.kind(),
                    error = %err,
                    "command failed"
                );
                err.into_response(request_id)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audit::InMemoryAuditStore;
    use crate::broker::sim::SimUpstream;
    use crate::bus::BusConfig;
    use crate::config::SessionSettings;
    use crate::models::Command;

    async fn started_worker(
        establish: bool,
    ) -> (Arc<CorrelationBus>, Arc<SimUpstream>, CancellationToken) {
        let sim = Arc::new(SimUpstream::new());
        let upstream: Arc<dyn UpstreamPort> = Arc::clone(&sim) as Arc<dyn UpstreamPort>;

        let (bus, queue) = CorrelationBus::new(BusConfig {
            queue_depth: 16,
            response_ttl: Duration::from_secs(5),
            quote_capacity: 64,
        });
        let bus = Arc::new(bus);

        let session = Arc::new(SessionManager::new(
            Arc::clone(&upstream),
            TradingMode::Simulation,
            SessionSettings {
                reconnect_delay_initial: Duration::from_millis(1),
                reconnect_delay_max: Duration::from_millis(5),
                reconnect_delay_multiplier: 2.0,
                max_login_attempts: 3,
            },
            vec![],
        ));
        if establish {
            assert!(session.establish().await);
        }

        let quotes = Arc::new(QuoteManager::new(
            Arc::clone(&upstream),
            Arc::clone(&bus),
            Arc::clone(&session),
        ));
        let audit = Arc::new(InMemoryAuditStore::new());
        let worker = Arc::new(Worker::new(
            Arc::clone(&bus),
            session,
            upstream,
            quotes,
            audit,
        ));

        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&worker).run(queue, shutdown.clone()));
        (bus, sim, shutdown)
    }

    #[tokio::test]
    async fn unready_session_rejects_with_retryable_marker() {
        let (bus, _sim, _shutdown) = started_worker(false).await;

        let id = bus.submit(Command::ListPositions, true).unwrap();
        let response = bus
            .await_response(&id, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(response.status, crate::models::ResponseStatus::Failed);
        assert!(response.retryable);
        assert_eq!(response.error, Some(ErrorKind::SessionNotReady));
    }

    #[tokio::test]
    async fn mode_mismatch_is_a_validation_failure() {
        let (bus, _sim, _shutdown) = started_worker(true).await;

        let id = bus.submit(Command::ListPositions, false).unwrap();
        let response = bus
            .await_response(&id, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(response.error, Some(ErrorKind::Validation));
        assert!(!response.retryable);
    }

    #[tokio::test]
    async fn every_consumed_request_writes_exactly_one_reply() {
        let (bus, _sim, _shutdown) = started_worker(true).await;

        let first = bus.submit(Command::ListPositions, true).unwrap();
        let second = bus.submit(Command::QueryUsage, true).unwrap();

        let response_first = bus
            .await_response(&first, Duration::from_secs(1))
            .await
            .unwrap();
        let response_second = bus
            .await_response(&second, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(response_first.request_id, first);
        assert_eq!(response_second.request_id, second);
        assert_eq!(bus.pending_replies(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_requests() {
        let (bus, _sim, shutdown) = started_worker(true).await;

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Queue side still accepts until the receiver drops; either way the
        // caller observes an infrastructure-style failure.
        match bus.submit(Command::ListPositions, true) {
            Err(crate::bus::BusError::WorkerGone) => {}
            Ok(id) => {
                let result = bus.await_response(&id, Duration::from_millis(200)).await;
                match result {
                    Ok(response) => assert!(response.retryable),
                    Err(err) => assert!(matches!(err, crate::bus::BusError::TimedOut(_))),
                }
            }
            Err(other) => panic!("unexpected submit error: {other}"),
        }
    }
}
