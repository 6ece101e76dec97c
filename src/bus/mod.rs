//! Correlation Bus
//!
//! Turns synchronous facade calls into correlated asynchronous jobs for the
//! single worker, and carries quote publications to the streaming hub.
//!
//! # Contract
//!
//! - `submit` enqueues onto one bounded FIFO work queue whose sole receiver
//!   is the worker: exactly one worker consumes each request, and a full
//!   queue rejects the submission (back-pressure is queue depth only).
//! - `await_response` blocks on a per-request reply slot; the first reader
//!   consumes the slot. Timing out leaves the outcome unknown — the worker
//!   will still complete, and the stored reply stays readable until TTL.
//! - `complete` writes the reply slot at most once (set-if-absent); a
//!   duplicate write is silently dropped and reported via the return value.
//! - `publish` fans a quote frame out on `quote.<alias>`; the hub's single
//!   pattern listener receives every channel and filters per socket.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::models::{
    quote_channel, Command, CommandRequest, CommandResponse, QuoteFrame, RequestId,
};

// =============================================================================
// Configuration
// =============================================================================

/// Bus sizing and expiry configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Work queue depth.
    pub queue_depth: usize,
    /// How long a stored reply stays readable.
    pub response_ttl: Duration,
    /// Quote broadcast channel capacity.
    pub quote_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            response_ttl: Duration::from_secs(30),
            quote_capacity: 4096,
        }
    }
}

impl From<&crate::config::BusSettings> for BusConfig {
    fn from(settings: &crate::config::BusSettings) -> Self {
        Self {
            queue_depth: settings.queue_depth,
            response_ttl: settings.response_ttl,
            quote_capacity: settings.quote_capacity,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Bus operation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The work queue is at capacity; the caller should shed load.
    #[error("work queue full (depth {0})")]
    QueueFull(usize),

    /// The worker side of the queue is gone.
    #[error("worker unavailable")]
    WorkerGone,

    /// No reply arrived within the caller's timeout; outcome unknown.
    #[error("timed out waiting for reply to {0}")]
    TimedOut(RequestId),

    /// Another reader is already blocked on this reply slot.
    #[error("reply to {0} is already being awaited")]
    AlreadyAwaited(RequestId),
}

// =============================================================================
// Reply Slots
// =============================================================================

enum ReplySlot {
    /// A reader is blocked waiting for the reply.
    Waiting(oneshot::Sender<CommandResponse>),
    /// The worker completed before any reader arrived.
    Ready {
        response: CommandResponse,
        stored_at: Instant,
    },
}

// =============================================================================
// Quote Events
// =============================================================================

/// One quote publication as seen by pattern listeners.
#[derive(Debug, Clone)]
pub struct QuoteEvent {
    /// Channel name, `quote.<alias>`.
    pub channel: String,
    /// The published frame.
    pub frame: QuoteFrame,
}

// =============================================================================
// Bus
// =============================================================================

/// The worker's end of the work queue. Single consumer by construction.
pub struct WorkQueue {
    rx: mpsc::Receiver<CommandRequest>,
}

impl WorkQueue {
    /// Block for the next request. Returns `None` when all submitters are gone.
    pub async fn next(&mut self) -> Option<CommandRequest> {
        self.rx.recv().await
    }

    /// Take whatever is queued right now without blocking.
    pub fn drain(&mut self) -> Vec<CommandRequest> {
        let mut drained = Vec::new();
        while let Ok(request) = self.rx.try_recv() {
            drained.push(request);
        }
        drained
    }
}

/// Shared request/response and pub/sub fabric.
pub struct CorrelationBus {
    queue_tx: mpsc::Sender<CommandRequest>,
    queue_depth: usize,
    replies: Mutex<HashMap<RequestId, ReplySlot>>,
    quotes_tx: broadcast::Sender<QuoteEvent>,
    response_ttl: Duration,
}

impl CorrelationBus {
    /// Create the bus and the worker's queue end.
    #[must_use]
    pub fn new(config: BusConfig) -> (Self, WorkQueue) {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_depth);
        let (quotes_tx, _) = broadcast::channel(config.quote_capacity);
        (
            Self {
                queue_tx,
                queue_depth: config.queue_depth,
                replies: Mutex::new(HashMap::new()),
                quotes_tx,
                response_ttl: config.response_ttl,
            },
            WorkQueue { rx: queue_rx },
        )
    }

    /// The reply TTL this bus stamps on envelopes.
    #[must_use]
    pub const fn response_ttl(&self) -> Duration {
        self.response_ttl
    }

    /// Build an envelope for `command` and enqueue it exactly once.
    ///
    /// # Errors
    ///
    /// Fails synchronously when the queue is full or the worker is gone; the
    /// request is not enqueued in either case.
    pub fn submit(&self, command: Command, simulation: bool) -> Result<RequestId, BusError> {
        let request = CommandRequest {
            request_id: next_request_id(),
            command,
            simulation,
            submitted_at: Utc::now(),
            response_ttl_ms: u64::try_from(self.response_ttl.as_millis()).unwrap_or(u64::MAX),
        };
        self.submit_request(request)
    }

    /// Enqueue a pre-built envelope.
    ///
    /// # Errors
    ///
    /// Fails synchronously when the queue is full or the worker is gone.
    pub fn submit_request(&self, request: CommandRequest) -> Result<RequestId, BusError> {
        let request_id = request.request_id.clone();
        match self.queue_tx.try_send(request) {
            Ok(()) => Ok(request_id),
            Err(mpsc::error::TrySendError::Full(_)) => Err(BusError::QueueFull(self.queue_depth)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BusError::WorkerGone),
        }
    }

    /// Block until the reply for `request_id` arrives or `timeout` elapses.
    ///
    /// The first reader consumes the slot: a reply stored before this call
    /// is returned immediately and deleted.
    ///
    /// # Errors
    ///
    /// `TimedOut` when no reply arrived in time (the outcome of the command
    /// is unknown), `AlreadyAwaited` when another reader holds the slot.
    pub async fn await_response(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> Result<CommandResponse, BusError> {
        let rx = {
            let mut replies = self.replies.lock();
            match replies.remove(request_id) {
                Some(ReplySlot::Ready {
                    response,
                    stored_at,
                }) => {
                    if stored_at.elapsed() <= self.response_ttl {
                        return Ok(response);
                    }
                    // Expired while stored; treat as absent.
                    return Err(BusError::TimedOut(request_id.to_string()));
                }
                Some(waiting @ ReplySlot::Waiting(_)) => {
                    replies.insert(request_id.to_string(), waiting);
                    return Err(BusError::AlreadyAwaited(request_id.to_string()));
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    replies.insert(request_id.to_string(), ReplySlot::Waiting(tx));
                    rx
                }
            }
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped without completing; only happens on worker death.
            Ok(Err(_)) => Err(BusError::WorkerGone),
            Err(_) => {
                let mut replies = self.replies.lock();
                if let Some(ReplySlot::Ready {
                    response,
                    stored_at: _,
                }) = replies.remove(request_id)
                {
                    // Completion raced our timeout; the reply is ours.
                    return Ok(response);
                }
                Err(BusError::TimedOut(request_id.to_string()))
            }
        }
    }

    /// Write the reply slot for `response.request_id`, set-if-absent.
    ///
    /// Returns `false` when a reply was already written (the duplicate is
    /// dropped).
    pub fn complete(&self, response: CommandResponse) -> bool {
        let request_id = response.request_id.clone();
        let mut replies = self.replies.lock();
        match replies.remove(&request_id) {
            None => {
                replies.insert(
                    request_id,
                    ReplySlot::Ready {
                        response,
                        stored_at: Instant::now(),
                    },
                );
                true
            }
            Some(ReplySlot::Waiting(tx)) => {
                if let Err(response) = tx.send(response) {
                    // The waiter timed out between registering and now; keep
                    // the reply readable until TTL.
                    replies.insert(
                        request_id,
                        ReplySlot::Ready {
                            response,
                            stored_at: Instant::now(),
                        },
                    );
                }
                true
            }
            Some(ready @ ReplySlot::Ready { .. }) => {
                replies.insert(request_id, ready);
                false
            }
        }
    }

    /// Drop stored replies older than the TTL. Returns how many were purged.
    pub fn purge_expired(&self) -> usize {
        let mut replies = self.replies.lock();
        let before = replies.len();
        replies.retain(|_, slot| match slot {
            ReplySlot::Waiting(_) => true,
            ReplySlot::Ready { stored_at, .. } => stored_at.elapsed() <= self.response_ttl,
        });
        before - replies.len()
    }

    /// Number of reply slots currently held (waiting or stored).
    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.replies.lock().len()
    }

    /// Publish a frame on `quote.<alias>`. Returns the listener count.
    pub fn publish(&self, alias: &str, frame: QuoteFrame) -> usize {
        let event = QuoteEvent {
            channel: quote_channel(alias),
            frame,
        };
        self.quotes_tx.send(event).unwrap_or(0)
    }

    /// Subscribe to every quote channel (the `quote.*` pattern).
    #[must_use]
    pub fn subscribe_quotes(&self) -> broadcast::Receiver<QuoteEvent> {
        self.quotes_tx.subscribe()
    }
}

/// Generate a globally unique request id.
fn next_request_id() -> RequestId {
    format!("req-{:032x}", rand::random::<u128>())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::TickData;
    use crate::error::ErrorKind;

    fn test_bus(ttl: Duration) -> (CorrelationBus, WorkQueue) {
        CorrelationBus::new(BusConfig {
            queue_depth: 4,
            response_ttl: ttl,
            quote_capacity: 16,
        })
    }

    fn sample_frame() -> QuoteFrame {
        QuoteFrame::tick(
            "TMFR1",
            "TMFB6",
            &TickData {
                close: 17_500.0,
                open: 17_480.0,
                high: 17_520.0,
                low: 17_470.0,
                change_price: 20.0,
                change_rate: 0.11,
                volume: 1,
                total_volume: 100,
                ts: 1,
            },
        )
    }

    #[tokio::test]
    async fn submit_generates_unique_ids_and_preserves_fifo() {
        let (bus, mut queue) = test_bus(Duration::from_secs(5));

        let first = bus.submit(Command::ListPositions, true).unwrap();
        let second = bus.submit(Command::QueryMargin, true).unwrap();
        assert_ne!(first, second);

        assert_eq!(queue.next().await.unwrap().request_id, first);
        assert_eq!(queue.next().await.unwrap().request_id, second);
    }

    #[tokio::test]
    async fn full_queue_rejects_submission() {
        let (bus, _queue) = test_bus(Duration::from_secs(5));

        for _ in 0..4 {
            bus.submit(Command::ListPositions, true).unwrap();
        }
        let err = bus.submit(Command::ListPositions, true).unwrap_err();
        assert_eq!(err, BusError::QueueFull(4));
    }

    #[tokio::test]
    async fn dropped_worker_fails_submission() {
        let (bus, queue) = test_bus(Duration::from_secs(5));
        drop(queue);
        let err = bus.submit(Command::ListPositions, true).unwrap_err();
        assert_eq!(err, BusError::WorkerGone);
    }

    #[tokio::test]
    async fn complete_wakes_waiting_reader() {
        let (bus, mut queue) = test_bus(Duration::from_secs(5));
        let id = bus.submit(Command::ListPositions, true).unwrap();

        let request = queue.next().await.unwrap();
        let waiter = bus.await_response(&id, Duration::from_secs(1));

        let completer = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(bus.complete(CommandResponse::ok(
                request.request_id.clone(),
                serde_json::json!({})
            )));
        };

        let (result, ()) = tokio::join!(waiter, completer);
        assert_eq!(result.unwrap().request_id, id);
        assert_eq!(bus.pending_replies(), 0);
    }

    #[tokio::test]
    async fn reply_written_at_most_once() {
        let (bus, _queue) = test_bus(Duration::from_secs(5));

        let ok = CommandResponse::ok("req-x", serde_json::json!({"n": 1}));
        let dup = CommandResponse::failed("req-x", ErrorKind::Internal, "late duplicate");

        assert!(bus.complete(ok));
        assert!(!bus.complete(dup));

        let read = bus
            .await_response("req-x", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(read.data, Some(serde_json::json!({"n": 1})));
    }

    #[tokio::test]
    async fn first_reader_consumes_stored_reply() {
        let (bus, _queue) = test_bus(Duration::from_secs(5));
        bus.complete(CommandResponse::ok("req-y", serde_json::json!({})));

        bus.await_response("req-y", Duration::from_millis(10))
            .await
            .unwrap();

        // Slot is deleted after the first read.
        let err = bus
            .await_response("req-y", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::TimedOut(_)));
    }

    #[tokio::test]
    async fn stored_reply_expires_after_ttl() {
        let (bus, _queue) = test_bus(Duration::from_millis(30));
        bus.complete(CommandResponse::ok("req-z", serde_json::json!({})));

        tokio::time::sleep(Duration::from_millis(60)).await;

        let err = bus
            .await_response("req-z", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::TimedOut(_)));

        assert_eq!(bus.purge_expired(), 0); // already consumed by the read
        assert_eq!(bus.pending_replies(), 0);
    }

    #[tokio::test]
    async fn purge_drops_only_expired_replies() {
        let (bus, _queue) = test_bus(Duration::from_millis(40));
        bus.complete(CommandResponse::ok("req-old", serde_json::json!({})));

        tokio::time::sleep(Duration::from_millis(80)).await;
        bus.complete(CommandResponse::ok("req-new", serde_json::json!({})));

        assert_eq!(bus.purge_expired(), 1);
        assert_eq!(bus.pending_replies(), 1);
    }

    #[tokio::test]
    async fn late_completion_readable_after_local_timeout() {
        // Scenario: the facade gives up, the worker succeeds shortly after,
        // and a later read within TTL still sees the reply.
        let (bus, _queue) = test_bus(Duration::from_secs(5));

        let err = bus
            .await_response("req-late", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::TimedOut(_)));

        assert!(bus.complete(CommandResponse::ok("req-late", serde_json::json!({}))));

        let read = bus
            .await_response("req-late", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(read.request_id, "req-late");
    }

    #[tokio::test]
    async fn second_concurrent_reader_is_rejected() {
        let (bus, _queue) = test_bus(Duration::from_secs(5));

        let first = bus.await_response("req-two", Duration::from_millis(100));
        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            bus.await_response("req-two", Duration::from_millis(10)).await
        };

        let (first_result, second_result) = tokio::join!(first, second);
        assert!(matches!(first_result, Err(BusError::TimedOut(_))));
        assert!(matches!(second_result, Err(BusError::AlreadyAwaited(_))));
    }

    #[tokio::test]
    async fn publish_reaches_all_pattern_listeners() {
        let (bus, _queue) = test_bus(Duration::from_secs(5));
        let mut rx1 = bus.subscribe_quotes();
        let mut rx2 = bus.subscribe_quotes();

        assert_eq!(bus.publish("TMFR1", sample_frame()), 2);

        let event1 = rx1.recv().await.unwrap();
        let event2 = rx2.recv().await.unwrap();
        assert_eq!(event1.channel, "quote.TMFR1");
        assert_eq!(event2.frame.symbol, "TMFR1");
    }

    #[tokio::test]
    async fn publish_without_listeners_reports_zero() {
        let (bus, _queue) = test_bus(Duration::from_secs(5));
        assert_eq!(bus.publish("TMFR1", sample_frame()), 0);
    }
}
