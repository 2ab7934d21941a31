use thiserror::Error;

/// A convenience `Result` alias using [`PrismError`].
pub type PrismResult<T> = Result<T, PrismError>;

/// Top-level error type for Prism.
///
/// Task-level failures (timeouts, agent errors) are not represented here: they
/// are captured per task and never escape a batch. The variants below are the
/// ones that can reach a caller.
#[derive(Error, Debug)]
pub enum PrismError {
    /// The batch submission itself is unusable (empty, unknown agent, ...).
    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    /// An agent with the same identifier is already registered.
    #[error("Agent '{0}' is already registered")]
    DuplicateAgent(String),

    /// A task referenced an agent that was never registered.
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// Raised by an agent while executing a task.
    #[error("Agent error: {0}")]
    Agent(String),

    /// The scheduler no longer accepts work.
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// No port could be bound after exhausting every attempt.
    #[error("Port {port} in use (tried {attempts} consecutive port(s))")]
    PortInUse {
        /// First port that was tried.
        port: u16,
        /// Number of consecutive ports tried.
        attempts: u16,
    },

    /// An error from the broadcast layer.
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// Writing a status snapshot to durable storage failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A persisted snapshot could not be read back.
    #[error("Snapshot load error: {0}")]
    SnapshotLoad(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PrismError {
    /// Whether the error is fatal to the component that raised it.
    ///
    /// Only bind failures and invalid configuration stop a component; the
    /// rest are reported and the component keeps running.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PrismError::PortInUse { .. } | PrismError::Config(_))
    }
}
