//! Status aggregation and persistence for Prism.
//!
//! The [`StatusAggregator`] folds scheduler lifecycle events and explicit
//! typed updates into one live [`StatusSnapshot`], announces material changes
//! as [`StatusNotification`]s, and persists the snapshot through a
//! [`SnapshotStore`].
//!
//! # Main types
//!
//! - [`StatusAggregator`]: Owner of the live snapshot.
//! - [`StatusSnapshot`]: Global, per-agent and score state of one session.
//! - [`StatusUpdate`]: Closed set of changes callers may apply.
//! - [`StatusNotification`]: Change announcements for downstream consumers.
//! - [`FileSnapshotStore`]: Atomic JSON file persistence.

/// The aggregator itself.
pub mod aggregator;
/// Snapshot model and summaries.
pub mod snapshot;
/// Snapshot persistence backends.
pub mod store;
/// Typed updates and notifications.
pub mod update;

pub use aggregator::StatusAggregator;
pub use snapshot::{
    AgentCounts, AgentState, AgentStatus, GlobalStatus, HistoryEntry, HistoryKind, Phase, Score,
    ScoreState, StatusSnapshot, StatusSummary,
};
pub use store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use update::{AlertLevel, StatusNotification, StatusUpdate};
