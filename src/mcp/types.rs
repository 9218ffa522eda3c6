use crate::error::BridgeError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub type RequestId = u64;

/// Outgoing request written to the child's stdin
#[derive(Debug, Clone, Serialize)]
pub(crate) struct JsonRpcRequest<'a> {
    pub(crate) jsonrpc: &'static str,
    pub(crate) id: RequestId,
    pub(crate) method: &'a str,
    pub(crate) params: &'a Value,
}

/// Outgoing notification written to the child's stdin
#[derive(Debug, Clone, Serialize)]
pub(crate) struct JsonRpcNotification<'a> {
    pub(crate) jsonrpc: &'static str,
    pub(crate) method: &'a str,
    pub(crate) params: &'a Value,
}

/// Error object carried by a JSON-RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: Option<i64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcError> for BridgeError {
    fn from(err: RpcError) -> Self {
        BridgeError::RemoteError {
            code: err.code,
            message: err.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// A message read from the child's stdout
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Response {
        id: RequestId,
        outcome: std::result::Result<Value, RpcError>,
    },
    Notification(Notification),
}

/// Loose shape of any JSON-RPC object; classified by [`Message::from_slice`].
#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

// Distinguishes `"result": null` (Some(Null)) from an absent field (None).
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Message {
    /// Parse and classify one framed line.
    pub fn from_slice(line: &[u8]) -> crate::Result<Message> {
        let raw: RawMessage = serde_json::from_slice(line)
            .map_err(|e| BridgeError::MalformedMessage(format!("invalid JSON: {}", e)))?;

        let id = match raw.id {
            None => None,
            Some(value) => Some(value.as_u64().ok_or_else(|| {
                BridgeError::MalformedMessage(format!("unsupported id: {}", value))
            })?),
        };
        let params = raw.params.unwrap_or(Value::Null);

        match (id, raw.method) {
            (Some(id), Some(method)) => Ok(Message::Request { id, method, params }),
            (None, Some(method)) => Ok(Message::Notification(Notification { method, params })),
            (Some(id), None) => match (raw.result, raw.error) {
                (Some(result), None) => Ok(Message::Response {
                    id,
                    outcome: Ok(result),
                }),
                (None, Some(error)) => Ok(Message::Response {
                    id,
                    outcome: Err(error),
                }),
                (Some(_), Some(_)) => Err(BridgeError::MalformedMessage(format!(
                    "response {} carries both result and error",
                    id
                ))),
                (None, None) => Err(BridgeError::MalformedMessage(format!(
                    "response {} carries neither result nor error",
                    id
                ))),
            },
            (None, None) => Err(BridgeError::MalformedMessage(
                "message has neither id nor method".to_string(),
            )),
        }
    }
}

/// Server info and catalog names captured by the last successful handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySnapshot {
    pub server_info: Value,
    pub tool_names: Vec<String>,
    pub resource_names: Vec<String>,
    pub prompt_names: Vec<String>,
}

/// Represents an MCP tool definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// Request to call an MCP tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Response from an MCP tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResponse {
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolCallResponse {
    /// Error-shaped response handed to the browser when the call itself failed
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptResult {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub messages: Vec<PromptMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serializes_in_wire_order() {
        let params = json!({"name": "best_move"});
        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id: 7,
            method: "tools/call",
            params: &params,
        };

        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"name":"best_move"}}"#
        );
    }

    #[test]
    fn test_parse_success_response() {
        let msg = Message::from_slice(br#"{"jsonrpc":"2.0","id":3,"result":{"tools":[]}}"#)
            .unwrap();
        assert_eq!(
            msg,
            Message::Response {
                id: 3,
                outcome: Ok(json!({"tools": []}))
            }
        );
    }

    #[test]
    fn test_parse_null_result_is_a_result() {
        let msg = Message::from_slice(br#"{"jsonrpc":"2.0","id":4,"result":null}"#).unwrap();
        assert_eq!(
            msg,
            Message::Response {
                id: 4,
                outcome: Ok(Value::Null)
            }
        );
    }

    #[test]
    fn test_parse_error_response() {
        let msg = Message::from_slice(
            br#"{"jsonrpc":"2.0","id":5,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();

        match msg {
            Message::Response {
                id: 5,
                outcome: Err(err),
            } => {
                assert_eq!(err.code, Some(-32601));
                assert_eq!(err.message, "Method not found");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_notification_and_server_request() {
        let msg = Message::from_slice(
            br#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            Message::Notification(Notification {
                method: "notifications/tools/list_changed".to_string(),
                params: Value::Null,
            })
        );

        let msg = Message::from_slice(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert!(matches!(msg, Message::Request { id: 1, .. }));
    }

    #[test]
    fn test_parse_rejects_ambiguous_or_empty_messages() {
        assert!(Message::from_slice(br#"{"jsonrpc":"2.0"}"#).is_err());
        assert!(Message::from_slice(br#"{"id":1}"#).is_err());
        assert!(
            Message::from_slice(br#"{"id":1,"result":1,"error":{"message":"x"}}"#).is_err()
        );
        assert!(Message::from_slice(br#"{"id":"abc","result":1}"#).is_err());
        assert!(Message::from_slice(b"INFO starting up").is_err());
    }

    #[test]
    fn test_tool_call_response_wire_shape() {
        let value = json!({
            "content": [{"type": "text", "text": "position 5"}],
            "isError": false
        });
        let response: ToolCallResponse = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(
            response.content,
            vec![ToolContent::Text {
                text: "position 5".to_string()
            }]
        );
        assert_eq!(serde_json::to_value(&response).unwrap(), value);
    }
}
