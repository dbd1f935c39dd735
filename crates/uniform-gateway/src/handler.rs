//! JSON-RPC request handlers.

use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};
use uniform_core::codec::Encoder;
use uniform_core::{Action, Channel, ChannelError, ConnectionQuery, Path, Value};

/// JSON-RPC method-not-found code.
const METHOD_NOT_FOUND: i32 = -32601;

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<JsonValue>,
    pub id: Option<JsonValue>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<JsonValue>,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<JsonValue>, result: JsonValue) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<JsonValue>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }
}

/// Health check endpoint.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({"status": "ok", "channel": state.channel.name()}))
}

/// Main JSON-RPC handler.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let method = request.method.as_str();
    let params = request.params.unwrap_or(JsonValue::Object(Default::default()));
    let id = request.id.clone();

    debug!("RPC call: {}({:?})", method, params);

    let result = match method {
        "health_check" => Ok(json!({"status": "ok", "channel": state.channel.name()})),
        "invoke" | "call" | "get" | "connections" | "exposed" => {
            dispatch_method(&state.channel, method, &params).await
        }
        _ => {
            return (
                StatusCode::OK,
                Json(JsonRpcResponse::error(
                    id,
                    METHOD_NOT_FOUND,
                    format!("Method not found: {}", method),
                )),
            );
        }
    };

    match result {
        Ok(value) => (StatusCode::OK, Json(JsonRpcResponse::success(id, value))),
        Err(e) => {
            error!("RPC error for {}: {}", method, e);
            let code = e.to_rpc_error_code();
            (
                StatusCode::OK,
                Json(JsonRpcResponse::error(id, code, e.to_string())),
            )
        }
    }
}

// ============================================================================
// Helper macros for extracting parameters
// ============================================================================

/// Extract an optional string parameter.
macro_rules! get_str_param {
    ($params:expr, $name:literal) => {
        $params.get($name).and_then(|v| v.as_str())
    };
}

/// Extract a required string parameter or return an error.
macro_rules! require_str_param {
    ($params:expr, $name:literal) => {
        match get_str_param!($params, $name) {
            Some(s) => s.to_string(),
            None => {
                return Err(ChannelError::Validation {
                    field: $name.to_string(),
                    message: format!("Missing required parameter: {}", $name),
                });
            }
        }
    };
}

// ============================================================================
// Method dispatcher
// ============================================================================

async fn dispatch_method(channel: &Channel, method: &str, params: &JsonValue) -> uniform_core::Result<JsonValue> {
    // Requests without a target go to the gateway's own channel.
    let target = get_str_param!(params, "target")
        .unwrap_or(channel.name())
        .to_string();

    match method {
        "invoke" => {
            let raw = require_str_param!(params, "action");
            let action: Action = raw.parse().unwrap_or(Action::Unknown);
            if action == Action::Unknown {
                return Err(ChannelError::Validation {
                    field: "action".to_string(),
                    message: format!("Unknown action: {}", raw),
                });
            }
            let path = path_param(params)?;
            let args = args_param(params)?;
            let value = match timeout_param(params) {
                Some(timeout) => {
                    channel
                        .invoke_with_timeout(&target, action, path, args, timeout)
                        .await?
                }
                None => channel.invoke(&target, action, path, args).await?,
            };
            Ok(render(channel, &value))
        }

        "call" => {
            let path = path_param(params)?;
            let args = args_param(params)?;
            let value = channel.call(&target, path, args).await?;
            Ok(render(channel, &value))
        }

        "get" => {
            let path = path_param(params)?;
            let prop = require_str_param!(params, "prop");
            let value = channel.get(&target, path, &prop).await?;
            Ok(render(channel, &value))
        }

        "connections" => {
            let query: ConnectionQuery = serde_json::from_value(params.clone())?;
            Ok(serde_json::to_value(channel.query_connections(&query))?)
        }

        "exposed" => Ok(json!(channel.exposed_modules())),

        _ => Err(ChannelError::Other(format!("Method not found: {}", method))),
    }
}

/// `path` as an array of segments or a dotted string.
fn path_param(params: &JsonValue) -> uniform_core::Result<Path> {
    match params.get("path") {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::String(dotted)) => Ok(dotted
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| match item {
                JsonValue::String(s) => Ok(s.clone()),
                JsonValue::Number(n) => Ok(n.to_string()),
                _ => Err(ChannelError::Validation {
                    field: "path".to_string(),
                    message: "path segments must be strings".to_string(),
                }),
            })
            .collect(),
        Some(_) => Err(ChannelError::Validation {
            field: "path".to_string(),
            message: "path must be an array or dotted string".to_string(),
        }),
    }
}

fn args_param(params: &JsonValue) -> uniform_core::Result<Vec<Value>> {
    match params.get("args") {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::Array(items)) => Ok(items.iter().cloned().map(Value::from).collect()),
        Some(_) => Err(ChannelError::Validation {
            field: "args".to_string(),
            message: "args must be an array".to_string(),
        }),
    }
}

fn timeout_param(params: &JsonValue) -> Option<Duration> {
    params
        .get("timeoutMs")
        .or_else(|| params.get("timeout_ms"))
        .and_then(|v| v.as_u64())
        .map(Duration::from_millis)
}

/// Render a result as JSON. References become their descriptor.
fn render(channel: &Channel, value: &Value) -> JsonValue {
    match value {
        Value::Remote(proxy) => serde_json::to_value(proxy.descriptor()).unwrap_or_default(),
        Value::Object(object) => {
            let encoder = Encoder::new(channel.name(), channel.name(), channel.registry());
            serde_json::to_value(encoder.export(object)).unwrap_or_default()
        }
        Value::List(items) => JsonValue::Array(items.iter().map(|v| render(channel, v)).collect()),
        Value::Map(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(channel, v)))
                .collect(),
        ),
        other => other.to_json().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uniform_core::{LoopbackBinding, ObjectRef};

    fn create_test_channel() -> Channel {
        let channel = Channel::new("gateway");
        channel.attach(LoopbackBinding::new(), Some("gateway"));
        channel.expose(
            "math",
            ObjectRef::new().with(
                "double",
                ObjectRef::function(|_, args| {
                    Ok(Value::Int(args.first().and_then(Value::as_i64).unwrap_or(0) * 2))
                }),
            ),
        );
        channel
    }

    #[test]
    fn test_path_param_accepts_array_and_dotted() {
        assert_eq!(path_param(&json!({"path": ["a", "b"]})).unwrap(), vec!["a", "b"]);
        assert_eq!(path_param(&json!({"path": "a.b"})).unwrap(), vec!["a", "b"]);
        assert!(path_param(&json!({})).unwrap().is_empty());
        assert!(path_param(&json!({"path": true})).is_err());
    }

    #[tokio::test]
    async fn test_call_on_own_channel() {
        let channel = create_test_channel();
        let result = dispatch_method(
            &channel,
            "call",
            &json!({"path": ["math", "double"], "args": [21]}),
        )
        .await
        .unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn test_get_renders_reference_as_descriptor() {
        let channel = create_test_channel();
        let result = dispatch_method(&channel, "get", &json!({"prop": "math"}))
            .await
            .unwrap();
        assert_eq!(result["ownerChannel"], json!("gateway"));
        assert_eq!(result["path"], json!(["math"]));
    }

    #[tokio::test]
    async fn test_invoke_rejects_unknown_action() {
        let channel = create_test_channel();
        let err = dispatch_method(&channel, "invoke", &json!({"action": "explode"}))
            .await
            .unwrap_err();
        assert_eq!(err.to_rpc_error_code(), -32005);
    }

    #[tokio::test]
    async fn test_unroutable_target_is_reported() {
        let channel = create_test_channel();
        let err = dispatch_method(&channel, "call", &json!({"target": "nowhere", "path": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NoRoute { .. }));
    }
}
