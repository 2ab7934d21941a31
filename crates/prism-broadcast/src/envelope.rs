use chrono::{DateTime, Utc};
use prism_status::{AgentState, AlertLevel, StatusNotification};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Envelope type tags.
pub mod types {
    pub const STATUS_UPDATE: &str = "status_update";
    pub const AGENT_UPDATE: &str = "agent_update";
    pub const SCORE_UPDATE: &str = "score_update";
    pub const ALERT: &str = "alert";
    pub const SESSION_RESET: &str = "session_reset";
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
}

/// Delivery priority. Ordered `Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
    Critical,
}

/// A typed, prioritized event as sent to clients and kept for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            priority: Priority::Normal,
            session_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// High and critical envelopes, and every score update, are replayed to
    /// newly connected clients.
    pub fn is_replayable(&self) -> bool {
        self.priority >= Priority::High || self.event_type == types::SCORE_UPDATE
    }

    pub fn to_json(&self) -> String {
        // Serializing a Value-backed struct cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Translate an aggregator notification into its wire envelope.
    pub fn from_notification(notification: &StatusNotification, session_id: &str) -> Self {
        let envelope = match notification {
            StatusNotification::StatusUpdated { global } => {
                let priority = if global.phase.is_terminal() {
                    Priority::High
                } else {
                    Priority::Normal
                };
                EventEnvelope::new(types::STATUS_UPDATE, json!(global)).with_priority(priority)
            }
            StatusNotification::AgentUpdated { agent_id, status } => {
                let priority = if status.state == AgentState::Failed {
                    Priority::High
                } else {
                    Priority::Normal
                };
                EventEnvelope::new(
                    types::AGENT_UPDATE,
                    json!({ "agentId": agent_id, "status": status }),
                )
                .with_priority(priority)
            }
            StatusNotification::ScoreUpdated {
                old,
                new,
                categories,
                deltas,
            } => EventEnvelope::new(
                types::SCORE_UPDATE,
                json!({
                    "old": old,
                    "new": new,
                    "categories": categories,
                    "deltas": deltas,
                }),
            )
            .with_priority(Priority::High),
            StatusNotification::Alert { level, entry } => {
                let priority = match level {
                    AlertLevel::Warning => Priority::High,
                    AlertLevel::Error => Priority::Critical,
                };
                EventEnvelope::new(
                    types::ALERT,
                    json!({
                        "level": level,
                        "kind": entry.kind,
                        "message": entry.message,
                        "timestamp": entry.timestamp,
                    }),
                )
                .with_priority(priority)
            }
            StatusNotification::SessionReset { session_id } => EventEnvelope::new(
                types::SESSION_RESET,
                json!({ "sessionId": session_id }),
            )
            .with_priority(Priority::High),
        };
        envelope.with_session(session_id)
    }
}

/// Reply to a control message, sent to one client only.
pub fn control_message(reply_type: &str, data: Value) -> String {
    json!({
        "type": reply_type,
        "data": data,
        "timestamp": Utc::now(),
    })
    .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MalformedMessage,
    InvalidPayload,
    RateLimited,
}

/// `{type:"error", data:{code, message}}`
pub fn error_message(code: ErrorCode, message: &str) -> String {
    control_message("error", json!({ "code": code, "message": message }))
}

/// Control messages a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Subscribe {
        types: Vec<String>,
    },
    Unsubscribe {
        types: Vec<String>,
    },
    SetFilters {
        min_priority: Option<Priority>,
        types: Option<Vec<String>>,
    },
    Ping,
    GetStatus,
    /// Anything else with a `type` tag, handed to the embedding application.
    Custom {
        message_type: String,
        data: Value,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Invalid payload for '{message_type}': {reason}")]
    InvalidPayload {
        message_type: String,
        reason: String,
    },
}

impl ParseError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ParseError::Malformed(_) => ErrorCode::MalformedMessage,
            ParseError::InvalidPayload { .. } => ErrorCode::InvalidPayload,
        }
    }
}

#[derive(Deserialize)]
struct TypesPayload {
    types: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FiltersPayload {
    #[serde(default)]
    min_priority: Option<Priority>,
    #[serde(default)]
    types: Option<Vec<String>>,
}

impl ClientMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ParseError::Malformed(e.to_string()))?;
        let message_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::Malformed("missing string field 'type'".into()))?
            .to_string();
        let data = value.get("data").cloned().unwrap_or(Value::Null);

        let invalid = |e: serde_json::Error| ParseError::InvalidPayload {
            message_type: message_type.clone(),
            reason: e.to_string(),
        };

        let message = match message_type.as_str() {
            "subscribe" => ClientMessage::Subscribe {
                types: serde_json::from_value::<TypesPayload>(data)
                    .map_err(invalid)?
                    .types,
            },
            "unsubscribe" => ClientMessage::Unsubscribe {
                types: serde_json::from_value::<TypesPayload>(data)
                    .map_err(invalid)?
                    .types,
            },
            "set_filters" => {
                let payload = if data.is_null() {
                    FiltersPayload::default()
                } else {
                    serde_json::from_value::<FiltersPayload>(data).map_err(invalid)?
                };
                ClientMessage::SetFilters {
                    min_priority: payload.min_priority,
                    types: payload.types,
                }
            }
            "ping" => ClientMessage::Ping,
            "get_status" => ClientMessage::GetStatus,
            _ => ClientMessage::Custom {
                message_type: message_type.clone(),
                data,
            },
        };
        Ok(message)
    }
}
