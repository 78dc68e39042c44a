//! Wire frames for the tool-endpoint protocol.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outbound request frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    pub params: RequestParams,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestParams {
    pub name: String,
    pub arguments: Value,
}

impl Request {
    pub fn call_tool(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            method: "callTool".into(),
            params: RequestParams {
                name: name.into(),
                arguments,
            },
        }
    }
}

/// Inbound response frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub result: Option<ToolResult>,
    #[serde(default)]
    pub error: Option<ErrorBody>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
}

/// Result envelope as produced by the remote endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentBlock>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ToolResult {
    /// Whether the endpoint flagged this result as a tool-level failure.
    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }

    /// Text of the first content block, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.content
            .as_ref()
            .and_then(|blocks| blocks.first())
            .and_then(|block| block.text.as_deref())
    }
}

/// Decode a successful result with graceful degradation.
///
/// Tier one: the first content block's text, parsed as JSON when it looks like
/// JSON, otherwise returned as a plain string. Tier two: the content array
/// when no text field exists. Tier three: the raw result object.
pub fn decode_result(result: &ToolResult) -> Value {
    if let Some(text) = result.first_text() {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()));
        }
        return Value::String(text.to_owned());
    }
    if let Some(content) = &result.content {
        return serde_json::to_value(content).unwrap_or_default();
    }
    serde_json::to_value(result).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_frame_shape() {
        let req = Request::call_tool("7", "searchGraph", json!({"query": "x"}));
        let frame = serde_json::to_value(&req).unwrap();
        assert_eq!(frame["id"], json!("7"));
        assert_eq!(frame["method"], json!("callTool"));
        assert_eq!(frame["params"]["name"], json!("searchGraph"));
        assert_eq!(frame["params"]["arguments"]["query"], json!("x"));
    }

    #[test]
    fn response_with_error_member() {
        let resp: Response =
            serde_json::from_str(r#"{"id":"1","error":{"message":"no such tool"}}"#).unwrap();
        assert_eq!(resp.id.as_deref(), Some("1"));
        assert_eq!(resp.error.unwrap().message.as_deref(), Some("no such tool"));
    }

    #[test]
    fn decode_json_text_payload() {
        let result: ToolResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "{\"count\": 3}"}]
        }))
        .unwrap();
        assert_eq!(decode_result(&result), json!({"count": 3}));
    }

    #[test]
    fn decode_plain_text_payload() {
        let result: ToolResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "all done"}]
        }))
        .unwrap();
        assert_eq!(decode_result(&result), json!("all done"));
    }

    #[test]
    fn decode_invalid_json_degrades_to_text() {
        let result: ToolResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "{not json"}]
        }))
        .unwrap();
        assert_eq!(decode_result(&result), json!("{not json"));
    }

    #[test]
    fn decode_content_without_text_returns_array() {
        let result: ToolResult = serde_json::from_value(json!({
            "content": [{"type": "image", "data": "abc"}]
        }))
        .unwrap();
        let decoded = decode_result(&result);
        assert!(decoded.is_array());
        assert_eq!(decoded[0]["type"], json!("image"));
    }

    #[test]
    fn decode_without_content_returns_raw_result() {
        let result: ToolResult = serde_json::from_value(json!({
            "records": [1, 2, 3]
        }))
        .unwrap();
        let decoded = decode_result(&result);
        assert_eq!(decoded["records"], json!([1, 2, 3]));
    }

    #[test]
    fn error_marker_detection() {
        let result: ToolResult = serde_json::from_value(json!({
            "isError": true,
            "content": [{"type": "text", "text": "tool exploded"}]
        }))
        .unwrap();
        assert!(result.is_error());
        assert_eq!(result.first_text(), Some("tool exploded"));
    }
}
