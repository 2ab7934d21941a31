use chrono::{DateTime, Utc};
use prism_core::BatchSummary;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Declared cost of running one agent, used only for admission decisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// Approximate memory units.
    #[serde(default)]
    pub memory: u64,
    /// CPU fraction, nominally `0.0..=1.0`.
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub network: bool,
    /// Paths that must be readable before the agent runs.
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl ResourceRequirement {
    pub fn new(memory: u64, cpu: f64) -> Self {
        Self {
            memory,
            cpu,
            ..Default::default()
        }
    }

    pub fn with_network(mut self) -> Self {
        self.network = true;
        self
    }

    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = files;
        self
    }
}

/// A unit of work targeting one registered agent.
///
/// Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub agent_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Overrides the agent's declared priority. Higher runs first.
    #[serde(default)]
    pub priority: Option<i32>,
    /// Overrides the batch and agent timeouts.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            params: serde_json::Value::Null,
            priority: None,
            timeout_ms: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Terminal outcome tag of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Success,
    Failure,
    Timeout,
}

/// Why a single attempt did not succeed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    #[error("Task timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Task execution failed: {0}")]
    Execution(String),

    #[error("Agent panicked: {0}")]
    Panicked(String),

    #[error("Required input missing: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("Scheduler shut down before the task finished")]
    Shutdown,
}

impl TaskError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskError::Timeout { .. } | TaskError::Execution(_) | TaskError::Panicked(_)
        )
    }

    pub fn outcome(&self) -> TaskOutcome {
        match self {
            TaskError::Timeout { .. } => TaskOutcome::Timeout,
            _ => TaskOutcome::Failure,
        }
    }
}

/// Result of one task, produced exactly once per submitted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: Uuid,
    pub agent_id: String,
    pub outcome: TaskOutcome,
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Attempts beyond the first.
    pub retries: u32,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.outcome == TaskOutcome::Success
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// Per-batch overrides of the scheduler defaults.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub max_concurrency: Option<usize>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Everything a batch submission returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    /// One entry per submitted task, in submission order.
    pub results: Vec<ExecutionResult>,
    pub summary: BatchSummary,
}

/// Point-in-time occupancy of the resource pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub slots_total: usize,
    pub slots_used: usize,
    pub memory_total: Option<u64>,
    pub memory_used: u64,
    pub cpu_total: Option<f64>,
    pub cpu_used: f64,
    pub network_total: Option<usize>,
    pub network_used: usize,
    /// Attempts waiting for admission across all batches.
    pub queued: usize,
}

impl PoolStatus {
    pub fn slots_free(&self) -> usize {
        self.slots_total.saturating_sub(self.slots_used)
    }
}

/// Execution counters tracked per agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub runs: u32,
    pub successes: u32,
    pub failures: u32,
    pub timeouts: u32,
    pub retries: u32,
    pub duration_ms: u64,
}
