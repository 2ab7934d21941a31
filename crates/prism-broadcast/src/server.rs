use crate::connection::{Connection, ConnectionRegistry, Outbound, OUTBOUND_QUEUE};
use crate::envelope::{
    control_message, error_message, types, ClientMessage, ErrorCode, EventEnvelope, Priority,
};
use crate::rate_limit::RateLimiter;
use crate::replay::ReplayBuffer;
use axum::{
    body::Bytes,
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use prism_core::{PrismError, PrismResult, ServerConfig};
use prism_status::StatusAggregator;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{
    broadcast::error::RecvError, mpsc, oneshot, OwnedSemaphorePermit, Semaphore,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CUSTOM_CHANNEL_CAPACITY: usize = 256;
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A client message with an unrecognized `type`, passed through unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomMessage {
    pub connection_id: Uuid,
    pub message_type: String,
    pub data: Value,
}

/// State shared by the HTTP handlers and background tasks.
struct AppState {
    registry: Arc<ConnectionRegistry>,
    replay: Mutex<ReplayBuffer>,
    limiter: RateLimiter,
    aggregator: Arc<StatusAggregator>,
    custom_tx: mpsc::Sender<CustomMessage>,
    port: AtomicU16,
    /// One permit per connection, held from upgrade until disconnect.
    slots: Arc<Semaphore>,
    max_connections: usize,
    replay_on_connect: usize,
}

impl AppState {
    fn publish(&self, envelope: EventEnvelope) -> usize {
        // A connecting client takes this lock to register, so it gets each
        // envelope either live or in its replay, never both.
        let mut replay = self.replay.lock();
        let delivered = self.registry.publish(&envelope);
        debug!(
            event_type = %envelope.event_type,
            priority = ?envelope.priority,
            delivered,
            "Envelope published"
        );
        replay.push(envelope);
        delivered
    }

    fn reply(&self, connection_id: Uuid, text: String) {
        self.registry.send_to(connection_id, Outbound::Text(text));
    }

    fn handle_client_message(&self, connection_id: Uuid, text: &str) {
        if !self.limiter.check(connection_id) {
            debug!(connection_id = %connection_id, "Inbound message rate limited");
            self.reply(
                connection_id,
                error_message(ErrorCode::RateLimited, "Too many messages, slow down"),
            );
            return;
        }

        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "Rejected client message");
                self.reply(connection_id, error_message(e.code(), &e.to_string()));
                return;
            }
        };

        match message {
            ClientMessage::Subscribe { types } => {
                let subscriptions = self
                    .registry
                    .with_filter(connection_id, |f| {
                        f.subscribe(&types);
                        f.subscriptions()
                    })
                    .unwrap_or_default();
                self.reply(
                    connection_id,
                    control_message(
                        "subscription_confirmed",
                        json!({ "subscriptions": subscriptions }),
                    ),
                );
            }
            ClientMessage::Unsubscribe { types } => {
                let subscriptions = self
                    .registry
                    .with_filter(connection_id, |f| {
                        f.unsubscribe(&types);
                        f.subscriptions()
                    })
                    .unwrap_or_default();
                self.reply(
                    connection_id,
                    control_message(
                        "subscription_confirmed",
                        json!({ "subscriptions": subscriptions }),
                    ),
                );
            }
            ClientMessage::SetFilters {
                min_priority,
                types,
            } => {
                let applied = self.registry.with_filter(connection_id, |f| {
                    f.set_filters(min_priority, types);
                    (f.min_priority(), f.allowed_types())
                });
                if let Some((min_priority, types)) = applied {
                    self.reply(
                        connection_id,
                        control_message(
                            "filters_updated",
                            json!({ "minPriority": min_priority, "types": types }),
                        ),
                    );
                }
            }
            ClientMessage::Ping => {
                self.reply(connection_id, control_message("pong", json!({})));
            }
            ClientMessage::GetStatus => {
                let snapshot = self.aggregator.snapshot();
                self.reply(
                    connection_id,
                    control_message("current_status", json!(snapshot)),
                );
            }
            ClientMessage::Custom { message_type, data } => {
                debug!(
                    connection_id = %connection_id,
                    message_type = %message_type,
                    "Custom client message"
                );
                let custom = CustomMessage {
                    connection_id,
                    message_type,
                    data,
                };
                if self.custom_tx.try_send(custom).is_err() {
                    debug!("Custom message dropped, no consumer keeping up");
                }
            }
        }
    }
}

struct Running {
    port: u16,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

/// WebSocket broadcast server for live status.
///
/// Serves `/ws` for clients, plus `/health` and `/status`. Aggregator
/// notifications are turned into envelopes and pushed to every matching
/// client; [`publish`](Self::publish) does the same for envelopes built by
/// the caller.
pub struct BroadcastServer {
    config: ServerConfig,
    state: Arc<AppState>,
    custom_rx: Mutex<Option<mpsc::Receiver<CustomMessage>>>,
    running: Mutex<Option<Running>>,
}

impl BroadcastServer {
    pub fn new(config: ServerConfig, aggregator: Arc<StatusAggregator>) -> Self {
        let (custom_tx, custom_rx) = mpsc::channel(CUSTOM_CHANNEL_CAPACITY);
        let state = Arc::new(AppState {
            registry: ConnectionRegistry::new(),
            replay: Mutex::new(ReplayBuffer::new(config.replay_capacity)),
            limiter: RateLimiter::new(config.rate_limit_max, config.rate_limit_window()),
            aggregator,
            custom_tx,
            port: AtomicU16::new(0),
            slots: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            replay_on_connect: config.replay_on_connect,
        });
        Self {
            config,
            state,
            custom_rx: Mutex::new(Some(custom_rx)),
            running: Mutex::new(None),
        }
    }

    /// Bind `port`, moving to the next port while it is taken, and start
    /// serving. Returns the port actually bound.
    pub async fn start(&self, port: u16) -> PrismResult<u16> {
        if self.running.lock().is_some() {
            return Err(PrismError::Broadcast("server already running".into()));
        }

        let listener = self.bind(port).await?;
        let bound = listener.local_addr()?.port();
        self.state.port.store(bound, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(Arc::clone(&self.state));
        let server = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "Broadcast server failed");
            }
        });

        let heartbeat = spawn_heartbeat(Arc::clone(&self.state), self.config.heartbeat_interval());
        let forwarder = spawn_forwarder(Arc::clone(&self.state));

        let mut running = self.running.lock();
        if running.is_some() {
            server.abort();
            heartbeat.abort();
            forwarder.abort();
            return Err(PrismError::Broadcast("server already running".into()));
        }
        *running = Some(Running {
            port: bound,
            shutdown: shutdown_tx,
            server,
            heartbeat,
            forwarder,
        });
        info!(host = %self.config.host, port = bound, "Broadcast server listening");
        Ok(bound)
    }

    async fn bind(&self, port: u16) -> PrismResult<TcpListener> {
        let attempts = self.config.max_port_attempts.max(1);
        for offset in 0..attempts {
            let Some(candidate) = port.checked_add(offset) else {
                break;
            };
            match TcpListener::bind((self.config.host.as_str(), candidate)).await {
                Ok(listener) => {
                    if offset > 0 {
                        info!(requested = port, bound = candidate, "Using fallback port");
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    warn!(port = candidate, "Port in use, trying the next one");
                }
                Err(e) => {
                    return Err(PrismError::Broadcast(format!(
                        "failed to bind {}:{candidate}: {e}",
                        self.config.host
                    )))
                }
            }
        }
        Err(PrismError::PortInUse { port, attempts })
    }

    /// Tell every client the server is going away, close all connections and
    /// release the listening socket.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.heartbeat.abort();
        running.forwarder.abort();

        let farewell = EventEnvelope::new(
            types::SERVER_SHUTDOWN,
            json!({ "reason": "server stopping" }),
        )
        .with_priority(Priority::Critical)
        .with_session(self.state.aggregator.session_id());
        let closed = self
            .state
            .registry
            .close_all(&farewell.to_json(), close_code::AWAY, "server stopping");

        let _ = running.shutdown.send(());
        let mut server = running.server;
        if tokio::time::timeout(STOP_TIMEOUT, &mut server).await.is_err() {
            warn!("Broadcast server did not stop in time, aborting");
            server.abort();
        }
        self.state.port.store(0, Ordering::SeqCst);
        info!(port = running.port, closed, "Broadcast server stopped");
    }

    /// Deliver an envelope to every matching client and keep it for replay.
    /// Returns the number of clients it was queued for.
    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        self.state.publish(envelope)
    }

    /// Receiver for client messages with unrecognized types. Only the first
    /// call gets it.
    pub fn take_custom_messages(&self) -> Option<mpsc::Receiver<CustomMessage>> {
        self.custom_rx.lock().take()
    }

    /// Bound port while running.
    pub fn port(&self) -> Option<u16> {
        self.running.lock().as_ref().map(|r| r.port)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.state.registry.len()
    }

    /// Envelopes currently held for replay.
    pub fn buffered(&self) -> usize {
        self.state.replay.lock().len()
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "prism",
        "connections": state.registry.len(),
        "port": state.port.load(Ordering::SeqCst),
    }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.aggregator.summary())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    // Reserved before upgrading so concurrent upgrades cannot overshoot.
    let Ok(slot) = Arc::clone(&state.slots).try_acquire_owned() else {
        warn!(
            max_connections = state.max_connections,
            "Connection limit reached, refusing upgrade"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, slot))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, slot: OwnedSemaphorePermit) {
    let connection_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    let conn = Connection::new(connection_id, tx);
    let eviction = conn.eviction();
    let session_id = state.aggregator.session_id();

    let replayed = {
        let replay = state.replay.lock();
        // Leave room for the welcome frame.
        let backlog =
            replay.recent_replayable(state.replay_on_connect.min(OUTBOUND_QUEUE - 1));
        state.registry.add(conn);
        let welcome = control_message(
            "connected",
            json!({
                "connectionId": connection_id,
                "sessionId": session_id,
                "replayed": backlog.len(),
            }),
        );
        state.reply(connection_id, welcome);
        for envelope in &backlog {
            state.reply(connection_id, envelope.to_json());
        }
        backlog.len()
    };
    info!(connection_id = %connection_id, replayed, "WebSocket connected");

    // Task: forward queued frames to the WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let (message, last) = match frame {
                Outbound::Text(text) => (Message::Text(text.into()), false),
                Outbound::Ping => (Message::Ping(Bytes::new()), false),
                Outbound::Close { code, reason } => (
                    Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })),
                    true,
                ),
            };
            if ws_sender.send(message).await.is_err() || last {
                break;
            }
        }
    });

    // Task: read client frames; any frame answers the liveness probe
    let reader_state = Arc::clone(&state);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_receiver.next().await {
            reader_state.registry.touch(connection_id);
            match message {
                Message::Text(text) => {
                    reader_state.handle_client_message(connection_id, text.as_str());
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
        () = eviction.notified() => {
            send_task.abort();
            recv_task.abort();
        }
    }

    drop(slot);
    state.registry.remove(connection_id);
    state.limiter.remove(connection_id);
    info!(connection_id = %connection_id, "WebSocket disconnected");
}

fn spawn_heartbeat(state: Arc<AppState>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let dead = state.registry.sweep();
            for id in dead {
                state.limiter.remove(id);
            }
        }
    })
}

fn spawn_forwarder(state: Arc<AppState>) -> JoinHandle<()> {
    let mut notifications = state.aggregator.subscribe();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => {
                    let envelope = EventEnvelope::from_notification(
                        &notification,
                        &state.aggregator.session_id(),
                    );
                    state.publish(envelope);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Broadcast forwarder fell behind status notifications");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
