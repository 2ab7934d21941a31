//! Core types and error definitions for Prism.
//!
//! This crate holds the pieces every other Prism crate agrees on: the error
//! taxonomy, the lifecycle events the scheduler emits, and the configuration
//! file model.
//!
//! # Main types
//!
//! - [`PrismError`]: Unified error enum for all Prism subsystems.
//! - [`PrismResult`]: Convenience alias for `Result<T, PrismError>`.
//! - [`SchedulerEvent`]: Task and batch lifecycle events.
//! - [`BatchSummary`]: Aggregate outcome of one submitted batch.
//! - [`PrismConfig`]: Top-level configuration loaded from `prism.toml`.

/// Configuration model and loading.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Scheduler lifecycle events.
pub mod event;

pub use config::{PrismConfig, SchedulerConfig, ServerConfig, StatusConfig};
pub use error::{PrismError, PrismResult};
pub use event::{BatchSummary, SchedulerEvent};
