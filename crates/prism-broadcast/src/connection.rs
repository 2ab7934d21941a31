use crate::envelope::EventEnvelope;
use crate::filter::ClientFilter;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};
use uuid::Uuid;

/// Frames that may wait for one client's writer before the client is evicted.
pub const OUTBOUND_QUEUE: usize = 256;

/// A frame queued for one client's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    /// Liveness probe.
    Ping,
    /// Close frame; the writer stops after sending it.
    Close { code: u16, reason: String },
}

/// Represents a connected WebSocket client.
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub tx: mpsc::Sender<Outbound>,
    pub filter: ClientFilter,
    /// Signalled when the client is dropped without flushing its queue.
    evicted: Arc<Notify>,
    /// Cleared when a probe is sent, set again by any inbound frame.
    pub alive: bool,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Connection {
    pub fn new(id: Uuid, tx: mpsc::Sender<Outbound>) -> Self {
        let now = Utc::now();
        Self {
            id,
            tx,
            filter: ClientFilter::default(),
            evicted: Arc::new(Notify::new()),
            alive: true,
            connected_at: now,
            last_seen: now,
        }
    }

    /// Resolves through [`Notify::notified`] once the client is evicted. The
    /// socket task selects on it to stop a writer stuck on a client that
    /// does not read.
    pub fn eviction(&self) -> Arc<Notify> {
        Arc::clone(&self.evicted)
    }

    /// Queue a close frame, or evict outright if the queue has no room.
    fn close(&self, code: u16, reason: &str) {
        let frame = Outbound::Close {
            code,
            reason: reason.to_string(),
        };
        if self.tx.try_send(frame).is_err() {
            self.evicted.notify_one();
        }
    }
}

/// Registry of live connections, keyed by connection id.
///
/// The registry holds the only sender to each writer task, so removing a
/// connection ends its writer once queued frames are flushed. A client whose
/// queue is full is evicted instead: its queue is discarded and the socket
/// task is told to stop.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, conn: Connection) {
        let id = conn.id;
        self.connections.write().insert(id, conn);
        info!(connection_id = %id, "Connection added");
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let removed = self.connections.write().remove(&id).is_some();
        if removed {
            info!(connection_id = %id, "Connection removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.connections.read().contains_key(&id)
    }

    /// Drop a client without flushing its queue.
    pub fn evict(&self, id: Uuid) -> bool {
        let Some(conn) = self.connections.write().remove(&id) else {
            return false;
        };
        warn!(connection_id = %id, "Client not keeping up, evicting");
        conn.evicted.notify_one();
        true
    }

    /// Queue a frame for one client. Returns `false` if it is gone; a client
    /// whose queue is full is evicted.
    pub fn send_to(&self, id: Uuid, frame: Outbound) -> bool {
        let sent = match self.connections.read().get(&id) {
            Some(conn) => conn.tx.try_send(frame).is_ok(),
            None => return false,
        };
        if !sent {
            self.evict(id);
        }
        sent
    }

    /// Mark a client as having answered the outstanding probe.
    pub fn touch(&self, id: Uuid) {
        if let Some(conn) = self.connections.write().get_mut(&id) {
            conn.alive = true;
            conn.last_seen = Utc::now();
        }
    }

    /// Apply `f` to a client's filter, returning its result.
    pub fn with_filter<R>(&self, id: Uuid, f: impl FnOnce(&mut ClientFilter) -> R) -> Option<R> {
        self.connections
            .write()
            .get_mut(&id)
            .map(|conn| f(&mut conn.filter))
    }

    /// Deliver an envelope to every client whose filter admits it.
    ///
    /// A client whose writer is gone or whose queue is full is evicted.
    /// Returns the number of clients the envelope was queued for.
    pub fn publish(&self, envelope: &EventEnvelope) -> usize {
        let text = envelope.to_json();
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let conns = self.connections.read();
            for conn in conns.values() {
                if !conn.filter.admits(envelope) {
                    continue;
                }
                if conn.tx.try_send(Outbound::Text(text.clone())).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(conn.id);
                }
            }
        }
        for id in dead {
            self.evict(id);
        }
        delivered
    }

    /// One liveness round: clients that never answered the previous probe
    /// are closed and removed, the rest are probed again.
    ///
    /// Returns the ids of removed clients.
    pub fn sweep(&self) -> Vec<Uuid> {
        let mut dead = Vec::new();
        {
            let mut conns = self.connections.write();
            for conn in conns.values_mut() {
                if conn.alive {
                    conn.alive = false;
                    if conn.tx.try_send(Outbound::Ping).is_err() {
                        dead.push(conn.id);
                    }
                } else {
                    dead.push(conn.id);
                }
            }
        }

        for &id in &dead {
            if let Some(conn) = self.connections.write().remove(&id) {
                warn!(
                    connection_id = %id,
                    last_seen = %conn.last_seen,
                    "Connection missed heartbeat, closing"
                );
                conn.close(axum::extract::ws::close_code::AWAY, "heartbeat timeout");
            }
        }
        dead
    }

    /// Send `farewell` then a close frame to every client and forget them all.
    pub fn close_all(&self, farewell: &str, code: u16, reason: &str) -> usize {
        let drained: Vec<Connection> = self.connections.write().drain().map(|(_, c)| c).collect();
        for conn in &drained {
            if conn.tx.try_send(Outbound::Text(farewell.to_string())).is_err() {
                conn.evicted.notify_one();
                continue;
            }
            conn.close(code, reason);
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Closed all connections");
        }
        drained.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }
}
