//! Newline-delimited JSON-RPC 2.0 framing for the daemon socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{codes, EngineError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    /// Chosen by the client; echoed back verbatim.
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn fail(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn from_error(id: Value, err: &EngineError) -> Self {
        Self::fail(id, err.code(), err.to_string())
    }
}

/// Parse one line into a request, producing the right JSON-RPC error codes
/// for garbage input.
pub fn parse_line(line: &str) -> Result<RpcRequest, RpcResponse> {
    let raw: Value = serde_json::from_str(line)
        .map_err(|err| RpcResponse::fail(Value::Null, codes::PARSE_ERROR, err.to_string()))?;
    let id = raw.get("id").cloned().unwrap_or(Value::Null);
    serde_json::from_value(raw)
        .map_err(|err| RpcResponse::fail(id, codes::INVALID_REQUEST, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_parse() {
        let req = parse_line(r#"{"id":7,"method":"tools/call","params":{"name":"go"}}"#).unwrap();
        assert_eq!(req.id, serde_json::json!(7));
        assert_eq!(req.method, "tools/call");
        assert_eq!(req.jsonrpc, "2.0");
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse_line("{nope").unwrap_err();
        assert_eq!(err.error.as_ref().unwrap().code, codes::PARSE_ERROR);
        assert_eq!(err.id, Value::Null);
    }

    #[test]
    fn missing_method_is_an_invalid_request_with_the_caller_id() {
        let err = parse_line(r#"{"id":"abc","params":{}}"#).unwrap_err();
        assert_eq!(err.error.as_ref().unwrap().code, codes::INVALID_REQUEST);
        assert_eq!(err.id, serde_json::json!("abc"));
    }

    #[test]
    fn engine_errors_map_to_their_codes() {
        let resp = RpcResponse::from_error(
            serde_json::json!(1),
            &EngineError::StaleHandle {
                handle: "@e1".into(),
            },
        );
        assert_eq!(resp.error.unwrap().code, codes::STALE_HANDLE);
    }

    #[test]
    fn responses_serialize_without_null_noise() {
        let ok = serde_json::to_string(&RpcResponse::ok(serde_json::json!(1), Value::Null)).unwrap();
        assert!(!ok.contains("error"));
        let fail =
            serde_json::to_string(&RpcResponse::fail(Value::Null, -32601, "nope")).unwrap();
        assert!(!fail.contains("result"));
    }
}
