use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Analytics event describing one enrollment lifecycle change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub sequence_id: Uuid,
    pub enrollment_id: Option<Uuid>,
    pub contact_id: Option<String>,
    pub step_id: Option<Uuid>,
    pub node_id: String,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Enrolled,
    StepCompleted,
    EmailSent,
    Branched,
    StepFailed,
    Completed,
    Exited,
    Converted,
    Paused,
    Resumed,
    Bounced,
    Unsubscribed,
    TriggerFired,
    WinnerDeclared,
}
