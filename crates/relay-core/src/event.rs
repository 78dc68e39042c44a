//! The event model shared by producers, the gateway, and UI consumers.
//!
//! Events are immutable once emitted. Well-known lifecycle and streaming types
//! get their own variants; anything else travels as `Other` so extension event
//! types pass through the bus untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ValidationError;
use crate::ids::{RunId, ThreadId};

/// Event type names as they appear on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    // Lifecycle
    RunStarted,
    RunFinished,
    RunError,
    StepStarted,
    StepFinished,

    // Streaming text
    TextMessageStart,
    TextMessageContent,
    TextMessageEnd,

    // Tool calls
    ToolCallStart,
    ToolCallArgs,
    ToolCallEnd,

    // State management
    StateSnapshot,
    StateDelta,
    MessagesSnapshot,

    // Escape hatches
    Raw,
    Custom,

    /// Extension event type not known to this crate.
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::RunStarted => "RunStarted",
            Self::RunFinished => "RunFinished",
            Self::RunError => "RunError",
            Self::StepStarted => "StepStarted",
            Self::StepFinished => "StepFinished",
            Self::TextMessageStart => "TextMessageStart",
            Self::TextMessageContent => "TextMessageContent",
            Self::TextMessageEnd => "TextMessageEnd",
            Self::ToolCallStart => "ToolCallStart",
            Self::ToolCallArgs => "ToolCallArgs",
            Self::ToolCallEnd => "ToolCallEnd",
            Self::StateSnapshot => "StateSnapshot",
            Self::StateDelta => "StateDelta",
            Self::MessagesSnapshot => "MessagesSnapshot",
            Self::Raw => "Raw",
            Self::Custom => "Custom",
            Self::Other(s) => s,
        }
    }

    /// Whether this event ends a run's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished | Self::RunError)
    }

    fn requires_run_id(&self) -> bool {
        matches!(self, Self::RunStarted | Self::RunFinished | Self::RunError)
    }

    fn requires_step_name(&self) -> bool {
        matches!(self, Self::StepStarted | Self::StepFinished)
    }

    fn requires_tool_call_id(&self) -> bool {
        match self {
            Self::ToolCallStart | Self::ToolCallArgs | Self::ToolCallEnd => true,
            Self::Other(s) => s.starts_with("ToolCall"),
            _ => false,
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "RunStarted" => Self::RunStarted,
            "RunFinished" => Self::RunFinished,
            "RunError" => Self::RunError,
            "StepStarted" => Self::StepStarted,
            "StepFinished" => Self::StepFinished,
            "TextMessageStart" => Self::TextMessageStart,
            "TextMessageContent" => Self::TextMessageContent,
            "TextMessageEnd" => Self::TextMessageEnd,
            "ToolCallStart" => Self::ToolCallStart,
            "ToolCallArgs" => Self::ToolCallArgs,
            "ToolCallEnd" => Self::ToolCallEnd,
            "StateSnapshot" => Self::StateSnapshot,
            "StateDelta" => Self::StateDelta,
            "MessagesSnapshot" => Self::MessagesSnapshot,
            "Raw" => Self::Raw,
            "Custom" => Self::Custom,
            _ => Self::Other(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_owned()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single bus event.
///
/// Known routing fields are typed; any other payload fields are preserved in
/// `payload` via serde flattening so producers can attach arbitrary data.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// An event of the given type with everything else empty.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            run_id: None,
            thread_id: None,
            step_name: None,
            tool_call_id: None,
            message_id: None,
            delta: None,
            metadata: Map::new(),
            timestamp: None,
            payload: Map::new(),
        }
    }

    /// Check the structural rules for this event's type.
    ///
    /// Lifecycle events need a run id, step events a step name, and tool-call
    /// events a tool-call id. The type itself must be non-empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.event_type.as_str().is_empty() {
            return Err(ValidationError::EmptyType);
        }
        if self.event_type.requires_run_id() && self.run_id.is_none() {
            return Err(ValidationError::MissingRunId {
                event_type: self.event_type.to_string(),
            });
        }
        if self.event_type.requires_step_name() && self.step_name.is_none() {
            return Err(ValidationError::MissingStepName {
                event_type: self.event_type.to_string(),
            });
        }
        if self.event_type.requires_tool_call_id() && self.tool_call_id.is_none() {
            return Err(ValidationError::MissingToolCallId {
                event_type: self.event_type.to_string(),
            });
        }
        Ok(())
    }

    /// Merge enrichment metadata and stamp the server-side timestamp.
    ///
    /// Producer-supplied metadata wins over nothing; enrichment keys overwrite
    /// producer keys of the same name, matching how the gateway treats its own
    /// annotations as authoritative.
    pub fn enrich(&mut self, extra: &Map<String, Value>, now: DateTime<Utc>) {
        for (k, v) in extra {
            self.metadata.insert(k.clone(), v.clone());
        }
        self.metadata
            .insert("timestamp".into(), Value::String(now.to_rfc3339()));
        self.timestamp = Some(now);
    }

    /// Payload field accessor, for the few fields the bus itself reads.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
