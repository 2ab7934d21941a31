use crate::update::AlertLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Overall phase of an analysis session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Analyzing,
    Complete,
    Error,
}

impl Phase {
    /// `Complete` and `Error` end a session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Error)
    }
}

/// Session-wide phase, progress and message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStatus {
    pub phase: Phase,
    /// Percentage in `0.0..=100.0`.
    pub progress: f64,
    #[serde(default)]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for GlobalStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            progress: 0.0,
            message: None,
            updated_at: Utc::now(),
        }
    }
}

/// Lifecycle state of one agent within the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl AgentState {
    pub fn is_settled(self) -> bool {
        matches!(self, AgentState::Completed | AgentState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub state: AgentState,
    pub progress: f64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            state: AgentState::Pending,
            progress: 0.0,
            message: None,
            started_at: None,
            finished_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// An aggregate score on a 0-100 scale with its per-category breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    pub value: f64,
    #[serde(default)]
    pub categories: BTreeMap<String, f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreState {
    #[serde(default)]
    pub current: Option<Score>,
    #[serde(default)]
    pub previous: Option<Score>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    BatchStarted,
    BatchCompleted,
    Info,
    Warning,
    Error,
}

impl HistoryKind {
    /// Warnings and errors are surfaced as alerts.
    pub fn alert_level(self) -> Option<AlertLevel> {
        match self {
            HistoryKind::Warning => Some(AlertLevel::Warning),
            HistoryKind::Error => Some(AlertLevel::Error),
            _ => None,
        }
    }
}

/// One entry of the operation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub kind: HistoryKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(kind: HistoryKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Complete status of one session, as held in memory and as persisted.
///
/// The on-disk form uses camelCase keys (`sessionId`, `lastSaved`,
/// `globalStatus`, `score`, `agents`, `operationHistory`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub session_id: String,
    #[serde(default)]
    pub last_saved: Option<DateTime<Utc>>,
    #[serde(default)]
    pub global_status: GlobalStatus,
    #[serde(default)]
    pub score: ScoreState,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentStatus>,
    /// Most recent history entries, oldest first.
    #[serde(default)]
    pub operation_history: Vec<HistoryEntry>,
}

impl StatusSnapshot {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            last_saved: None,
            global_status: GlobalStatus::default(),
            score: ScoreState::default(),
            agents: BTreeMap::new(),
            operation_history: Vec::new(),
        }
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

/// Count of agents in each state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Compact, externally queryable view of the live snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub session_id: String,
    pub phase: Phase,
    pub progress: f64,
    pub message: Option<String>,
    pub agents: AgentCounts,
    pub score: Option<f64>,
    pub last_saved: Option<DateTime<Utc>>,
    pub recent_history: Vec<HistoryEntry>,
}

impl StatusSummary {
    /// Summarize a snapshot, keeping at most `history` recent entries.
    pub fn from_snapshot(snapshot: &StatusSnapshot, history: usize) -> Self {
        let mut agents = AgentCounts::default();
        for status in snapshot.agents.values() {
            match status.state {
                AgentState::Pending => agents.pending += 1,
                AgentState::Running => agents.running += 1,
                AgentState::Completed => agents.completed += 1,
                AgentState::Failed => agents.failed += 1,
            }
        }
        let skip = snapshot.operation_history.len().saturating_sub(history);
        Self {
            session_id: snapshot.session_id.clone(),
            phase: snapshot.global_status.phase,
            progress: snapshot.global_status.progress,
            message: snapshot.global_status.message.clone(),
            agents,
            score: snapshot.score.current.as_ref().map(|s| s.value),
            last_saved: snapshot.last_saved,
            recent_history: snapshot.operation_history[skip..].to_vec(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_uses_camel_case_keys() {
        let snapshot = StatusSnapshot::new("session-1");
        let value = serde_json::to_value(&snapshot).unwrap();
        for key in [
            "sessionId",
            "lastSaved",
            "globalStatus",
            "score",
            "agents",
            "operationHistory",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(value["globalStatus"]["phase"], "idle");
    }

    #[test]
    fn test_sparse_document_is_accepted() {
        let snapshot: StatusSnapshot =
            serde_json::from_str(r#"{"sessionId":"abc"}"#).unwrap();
        assert_eq!(snapshot.session_id, "abc");
        assert_eq!(snapshot.global_status.phase, Phase::Idle);
        assert!(snapshot.agents.is_empty());
    }

    #[test]
    fn test_summary_counts_agents() {
        let mut snapshot = StatusSnapshot::new("s");
        snapshot.agents.insert(
            "security".into(),
            AgentStatus {
                state: AgentState::Completed,
                ..Default::default()
            },
        );
        snapshot.agents.insert(
            "quality".into(),
            AgentStatus {
                state: AgentState::Failed,
                ..Default::default()
            },
        );
        snapshot.agents.insert("structure".into(), AgentStatus::default());
        for i in 0..5 {
            snapshot
                .operation_history
                .push(HistoryEntry::new(HistoryKind::Info, format!("entry {i}")));
        }

        let summary = StatusSummary::from_snapshot(&snapshot, 2);
        assert_eq!(summary.agents.completed, 1);
        assert_eq!(summary.agents.failed, 1);
        assert_eq!(summary.agents.pending, 1);
        assert_eq!(summary.recent_history.len(), 2);
        assert_eq!(summary.recent_history[1].message, "entry 4");
    }

    #[test]
    fn test_terminal_phases() {
        assert!(Phase::Complete.is_terminal());
        assert!(Phase::Error.is_terminal());
        assert!(!Phase::Analyzing.is_terminal());
    }

    #[test]
    fn test_only_warnings_and_errors_alert() {
        assert_eq!(HistoryKind::Warning.alert_level(), Some(AlertLevel::Warning));
        assert_eq!(HistoryKind::Error.alert_level(), Some(AlertLevel::Error));
        assert_eq!(HistoryKind::Info.alert_level(), None);
        assert_eq!(HistoryKind::BatchCompleted.alert_level(), None);
    }
}
