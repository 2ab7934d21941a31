//! WebSocket broadcast layer for Prism.
//!
//! Clients connect to `/ws`, receive a welcome and a short replay of recent
//! important envelopes, and from then on get every [`EventEnvelope`] their
//! [`ClientFilter`] admits. Inbound control messages are rate limited per
//! connection, and connections that stop answering heartbeats are closed.
//!
//! # Main types
//!
//! - [`BroadcastServer`]: Listener lifecycle, publishing and HTTP routes.
//! - [`EventEnvelope`]: Typed, prioritized unit sent over the wire.
//! - [`ClientMessage`]: Parsed client control message.
//! - [`ConnectionRegistry`]: Live connections and their filters.
//! - [`ReplayBuffer`]: Bounded history used to catch up new clients.

/// Connection records and the registry.
pub mod connection;
/// Envelopes and the client wire protocol.
pub mod envelope;
/// Per-client delivery filters.
pub mod filter;
/// Inbound message rate limiting.
pub mod rate_limit;
/// Replay ring buffer.
pub mod replay;
/// The axum server.
pub mod server;

pub use connection::{Connection, ConnectionRegistry, Outbound};
pub use envelope::{types, ClientMessage, ErrorCode, EventEnvelope, ParseError, Priority};
pub use filter::ClientFilter;
pub use rate_limit::RateLimiter;
pub use replay::ReplayBuffer;
pub use server::{BroadcastServer, CustomMessage};
