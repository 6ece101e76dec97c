//! Streaming Hub
//!
//! Bridges browser WebSocket clients to the quote pipeline. Each socket
//! holds a subscription set of aliases; one pattern listener per process
//! drains the bus quote stream and fans each frame out only to the sockets
//! whose set contains the frame's alias.
//!
//! Refcounting stays centralized in the quote manager: the hub only issues
//! `subscribe_quote` / `unsubscribe_quote` commands through the bus, so the
//! first subscriber per alias causes the upstream call and the last
//! departure removes it. Disconnect cleanup is mandatory — the refcount is
//! the shared resource that matters.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::CorrelationBus;
use crate::config::HubSettings;
use crate::models::{alias_from_channel, Command, QuoteFrame, ResponseStatus};

// =============================================================================
// Message Grammar
// =============================================================================

/// Messages a streaming client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the quote stream for a symbol.
    Subscribe {
        /// Client-facing symbol.
        symbol: String,
        /// Account mode override; defaults to the worker's mode.
        #[serde(default)]
        simulation: Option<bool>,
    },
    /// Leave the quote stream for a symbol.
    Unsubscribe {
        /// Client-facing symbol.
        symbol: String,
    },
    /// Heartbeat.
    Ping,
}

/// Messages the hub sends to a streaming client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once on accept.
    Connected {
        /// Assigned client id.
        client_id: u64,
    },
    /// A subscription was established.
    Subscribed {
        /// The symbol joined.
        symbol: String,
    },
    /// A subscription was removed.
    Unsubscribed {
        /// The symbol left.
        symbol: String,
    },
    /// A quote frame for a subscribed symbol.
    Quote {
        /// The subscribed alias.
        symbol: String,
        /// The normalized frame.
        data: QuoteFrame,
    },
    /// Heartbeat reply.
    Pong,
    /// A client request failed.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

// =============================================================================
// Hub
// =============================================================================

struct ClientHandle {
    subscriptions: HashSet<String>,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

/// Registry of streaming clients and the process-wide pattern listener.
pub struct StreamingHub {
    bus: Arc<CorrelationBus>,
    settings: HubSettings,
    simulation: bool,
    clients: RwLock<HashMap<u64, ClientHandle>>,
    next_client_id: AtomicU64,
}

impl StreamingHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new(bus: Arc<CorrelationBus>, settings: HubSettings, simulation: bool) -> Self {
        Self {
            bus,
            settings,
            simulation,
            clients: RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Number of connected clients.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Number of clients subscribed to an alias.
    #[must_use]
    pub fn subscriber_count(&self, alias: &str) -> usize {
        self.clients
            .read()
            .values()
            .filter(|client| client.subscriptions.contains(alias))
            .count()
    }

    /// Register a client, returning its id and outbound stream. The
    /// `connected` greeting is already queued on the stream.
    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<ServerMessage>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ServerMessage::Connected { client_id });

        let mut clients = self.clients.write();
        clients.insert(
            client_id,
            ClientHandle {
                subscriptions: HashSet::new(),
                tx,
            },
        );
        crate::metrics::set_streaming_clients(clients.len());
        drop(clients);

        tracing::info!(client_id, "streaming client connected");
        (client_id, rx)
    }

    /// Remove a client and release every alias it held.
    pub async fn disconnect(&self, client_id: u64) {
        let held: Vec<String> = {
            let mut clients = self.clients.write();
            let Some(client) = clients.remove(&client_id) else {
                return;
            };
            crate::metrics::set_streaming_clients(clients.len());
            client.subscriptions.into_iter().collect()
        };

        for alias in held {
            if let Err(err) = self.issue_unsubscribe(&alias).await {
                tracing::warn!(client_id, alias = %alias, error = %err, "cleanup unsubscribe failed");
            }
        }
        tracing::info!(client_id, "streaming client disconnected");
    }

    /// Handle one parsed client message, returning the reply to send.
    pub async fn handle_message(&self, client_id: u64, message: ClientMessage) -> ServerMessage {
        match message {
            ClientMessage::Ping => ServerMessage::Pong,
            ClientMessage::Subscribe { symbol, simulation } => {
                self.handle_subscribe(client_id, symbol, simulation).await
            }
            ClientMessage::Unsubscribe { symbol } => {
                self.handle_unsubscribe(client_id, symbol).await
            }
        }
    }

    async fn handle_subscribe(
        &self,
        client_id: u64,
        symbol: String,
        simulation: Option<bool>,
    ) -> ServerMessage {
        let already_held = self
            .clients
            .read()
            .get(&client_id)
            .is_some_and(|client| client.subscriptions.contains(&symbol));
        if already_held {
            // The worker already counts this client; don't double-join.
            return ServerMessage::Subscribed { symbol };
        }

        let simulation = simulation.unwrap_or(self.simulation);
        match self
            .issue_command(
                Command::SubscribeQuote {
                    symbol: symbol.clone(),
                },
                simulation,
            )
            .await
        {
            Ok(()) => {
                let recorded = self
                    .clients
                    .write()
                    .get_mut(&client_id)
                    .map(|client| client.subscriptions.insert(symbol.clone()))
                    .is_some();
                if !recorded {
                    // The socket closed while the join was in flight; release
                    // it so the refcount keeps matching live clients.
                    if let Err(err) = self.issue_unsubscribe(&symbol).await {
                        tracing::warn!(client_id, symbol = %symbol, error = %err, "orphan join release failed");
                    }
                }
                ServerMessage::Subscribed { symbol }
            }
            Err(message) => ServerMessage::Error { message },
        }
    }

    async fn handle_unsubscribe(&self, client_id: u64, symbol: String) -> ServerMessage {
        let held = {
            let mut clients = self.clients.write();
            clients
                .get_mut(&client_id)
                .is_some_and(|client| client.subscriptions.remove(&symbol))
        };
        if !held {
            return ServerMessage::Error {
                message: format!("not subscribed to {symbol}"),
            };
        }

        match self.issue_unsubscribe(&symbol).await {
            Ok(()) => ServerMessage::Unsubscribed { symbol },
            Err(message) => ServerMessage::Error { message },
        }
    }

    async fn issue_unsubscribe(&self, symbol: &str) -> Result<(), String> {
        self.issue_command(
            Command::UnsubscribeQuote {
                symbol: symbol.to_string(),
            },
            self.simulation,
        )
        .await
    }

    async fn issue_command(&self, command: Command, simulation: bool) -> Result<(), String> {
        let request_id = self
            .bus
            .submit(command, simulation)
            .map_err(|err| err.to_string())?;

        match self
            .bus
            .await_response(&request_id, self.settings.command_timeout)
            .await
        {
            Ok(response) => match response.status {
                ResponseStatus::Ok | ResponseStatus::NoAction => Ok(()),
                ResponseStatus::Failed => Err(response
                    .message
                    .unwrap_or_else(|| "command failed".to_string())),
            },
            Err(err) => Err(err.to_string()),
        }
    }

    /// Spawn the process-wide pattern listener that fans bus quote events
    /// out to matching sockets.
    pub fn spawn_listener(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(self);
        let mut events = hub.bus.subscribe_quotes();
        tokio::spawn(async move {
            tracing::info!("quote listener started");
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    result = events.recv() => match result {
                        Ok(event) => {
                            let Some(alias) = alias_from_channel(&event.channel) else {
                                continue;
                            };
                            hub.deliver(alias, &event.frame);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "quote listener lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            tracing::info!("quote listener stopped");
        })
    }

    /// Queue a frame for every client subscribed to `alias`. Outbound order
    /// per socket follows enqueue order.
    fn deliver(&self, alias: &str, frame: &QuoteFrame) {
        let clients = self.clients.read();
        for client in clients.values() {
            if client.subscriptions.contains(alias) {
                let _ = client.tx.send(ServerMessage::Quote {
                    symbol: alias.to_string(),
                    data: frame.clone(),
                });
            }
        }
    }

    /// Drive one accepted WebSocket until it closes, errors, or idles out.
    pub async fn serve_socket(self: Arc<Self>, socket: WebSocket) {
        let (client_id, mut outbound) = self.register();
        let (mut ws_tx, mut ws_rx) = socket.split();
        let idle_timeout = self.settings.idle_timeout;
        let mut deadline = tokio::time::Instant::now() + idle_timeout;

        loop {
            tokio::select! {
                maybe = outbound.recv() => {
                    let Some(message) = maybe else { break };
                    let Ok(json) = serde_json::to_string(&message) else { continue };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    tracing::info!(client_id, "closing idle streaming client");
                    break;
                }
                incoming = ws_rx.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            deadline = tokio::time::Instant::now() + idle_timeout;
                            let reply = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                                Ok(message) => self.handle_message(client_id, message).await,
                                Err(err) => ServerMessage::Error {
                                    message: format!("invalid message: {err}"),
                                },
                            };
                            let Ok(json) = serde_json::to_string(&reply) else { continue };
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {
                            deadline = tokio::time::Instant::now() + idle_timeout;
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    }
                }
            }
        }

        self.disconnect(client_id).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
