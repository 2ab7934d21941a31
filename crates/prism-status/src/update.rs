use crate::snapshot::{AgentState, AgentStatus, GlobalStatus, HistoryEntry, Phase};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed change to the live snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "update", rename_all = "snake_case")]
pub enum StatusUpdate {
    PhaseChanged {
        phase: Phase,
    },
    ProgressChanged {
        progress: f64,
    },
    MessageChanged {
        message: Option<String>,
    },
    AgentStateChanged {
        agent_id: String,
        state: AgentState,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: Option<String>,
    },
    ScoreChanged {
        score: f64,
        #[serde(default)]
        categories: BTreeMap<String, f64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Error,
}

/// Raised by the aggregator whenever the snapshot changes materially.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusNotification {
    /// Global phase or progress changed.
    StatusUpdated { global: GlobalStatus },
    AgentUpdated {
        agent_id: String,
        status: AgentStatus,
    },
    /// The score moved by more than the material threshold.
    ScoreUpdated {
        old: Option<f64>,
        new: f64,
        categories: BTreeMap<String, f64>,
        /// Human-readable per-category changes, e.g. `security: 70.0 -> 82.5 (+12.5)`.
        deltas: Vec<String>,
    },
    Alert {
        level: AlertLevel,
        entry: HistoryEntry,
    },
    SessionReset { session_id: String },
}

impl StatusNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            StatusNotification::StatusUpdated { .. } => "status:updated",
            StatusNotification::AgentUpdated { .. } => "agent:updated",
            StatusNotification::ScoreUpdated { .. } => "score:updated",
            StatusNotification::Alert { .. } => "alert",
            StatusNotification::SessionReset { .. } => "session:reset",
        }
    }
}
