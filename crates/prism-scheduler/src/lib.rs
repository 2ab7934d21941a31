//! Resource-aware concurrent scheduler for analysis agents.
//!
//! Agents declare what one execution costs; the scheduler admits tasks only
//! while the pool has room, races each attempt against its timeout, retries
//! failures through the admission queue, and returns a complete summary even
//! when some tasks fail.
//!
//! # Main types
//!
//! - [`Scheduler`]: Agent registry, admission control, and batch execution.
//! - [`Agent`]: The execution contract implemented by analysis agents.
//! - [`ResourcePool`]: Slot and weight accounting used for admission.
//! - [`AdmissionQueue`]: Priority-then-FIFO queue of waiting attempts.
//! - [`AgentMonitor`]: Per-agent execution counters.

/// Agent execution contract.
pub mod agent;
/// Per-agent execution metrics.
pub mod monitor;
/// Resource pool accounting.
pub mod pool;
/// Batch execution engine.
pub mod scheduler;
/// Priority admission queue.
pub mod task_queue;
/// Tasks, results, options, and pool status.
pub mod types;

pub use agent::{Agent, AgentContext, ProgressReporter};
pub use monitor::AgentMonitor;
pub use pool::ResourcePool;
pub use prism_core::{BatchSummary, SchedulerEvent};
pub use scheduler::Scheduler;
pub use task_queue::AdmissionQueue;
pub use types::{
    AgentMetrics, BatchOptions, BatchResult, ExecutionResult, PoolStatus, ResourceRequirement,
    Task, TaskError, TaskOutcome,
};
