//! Control frames exchanged with consumer connections.
//!
//! Inbound frames are polymorphic: a handful of reserved `type` values are
//! control frames, and anything else is treated as an event pushed by a
//! producer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_core::event::{Event, EventType};
use relay_core::ids::{ClientId, RunId, ThreadId};
use relay_core::key::SubscriptionKey;

use crate::client::Registration;

/// Frames a client sends to the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "registration")]
    Registration(Registration),

    #[serde(rename = "subscribe", rename_all = "camelCase")]
    Subscribe {
        #[serde(default)]
        run_id: Option<RunId>,
        #[serde(default)]
        thread_id: Option<ThreadId>,
        #[serde(default)]
        event_type: Option<EventType>,
    },

    #[serde(rename = "unsubscribe", rename_all = "camelCase")]
    Unsubscribe {
        #[serde(default)]
        run_id: Option<RunId>,
        #[serde(default)]
        thread_id: Option<ThreadId>,
        #[serde(default)]
        event_type: Option<EventType>,
    },

    #[serde(rename = "call-tool", rename_all = "camelCase")]
    CallTool {
        request_id: String,
        tool_name: String,
        #[serde(default)]
        arguments: Value,
    },
}

/// Frames the server sends to a client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "ag-ui-registration-confirmation", rename_all = "camelCase")]
    RegistrationConfirmation {
        client_id: ClientId,
        message: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "ag-ui-subscription-confirmation", rename_all = "camelCase")]
    SubscriptionConfirmation {
        subscription_key: SubscriptionKey,
        run_id: Option<RunId>,
        thread_id: Option<ThreadId>,
        event_type: Option<EventType>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "tool-result", rename_all = "camelCase")]
    ToolResult {
        request_id: String,
        result: Value,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "tool-error", rename_all = "camelCase")]
    ToolError {
        request_id: String,
        code: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerFrame {
    pub fn encode(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// A parsed inbound frame.
#[derive(Clone, Debug)]
pub enum Inbound {
    Control(ClientFrame),
    Event(Event),
}

const CONTROL_TYPES: [&str; 4] = ["registration", "subscribe", "unsubscribe", "call-tool"];

/// Parse an inbound text frame.
///
/// Reserved `type` values must parse as control frames — a malformed control
/// frame is a protocol violation, never an event. Everything else parses as
/// an event.
pub fn parse_inbound(text: &str) -> Result<Inbound, String> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| format!("invalid json: {e}"))?;
    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "frame has no type".to_string())?;

    if CONTROL_TYPES.contains(&frame_type) {
        serde_json::from_value::<ClientFrame>(value.clone())
            .map(Inbound::Control)
            .map_err(|e| format!("malformed {frame_type} frame: {e}"))
    } else {
        serde_json::from_value::<Event>(value)
            .map(Inbound::Event)
            .map_err(|e| format!("malformed event frame: {e}"))
    }
}
