//! JSON-RPC 2.0 frames exchanged with plugins over stdin/stdout.
//!
//! Each frame is a single JSON object terminated by `\n`. The host only ever
//! sends requests and the plugin only ever sends responses, so ids are plain
//! integers allocated by the host.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version string carried in every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal plugin error.
pub const INTERNAL_ERROR: i64 = -32603;
/// The provisioner's backend rejected or failed the operation.
pub const APPLICATION_ERROR: i64 = -32000;
/// The plugin gave up because the request deadline passed.
pub const DEADLINE_EXCEEDED: i64 = -32001;

/// A request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Always `"2.0"`.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Host-allocated request id.
    pub id: u64,
    /// Wire method name.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// The error member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable status.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A response frame. Exactly one of `result` or `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Always `"2.0"`.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// `None` only when the request id could not be determined.
    pub id: Option<u64>,
    /// Result value of a successful call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error object of a failed call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

impl Request {
    /// Create a call.
    #[must_use]
    pub fn call(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            method: method.into(),
            params,
        }
    }
}

impl Response {
    /// A successful response.
    #[must_use]
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// A failed response.
    #[must_use]
    pub fn failure(id: Option<u64>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Split into the result value or the error object.
    ///
    /// A frame with neither member is treated as a `null` result.
    ///
    /// # Errors
    ///
    /// Returns the [`RpcError`] carried by a failed response.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.error, self.result) {
            (Some(err), _) => Err(err),
            (None, Some(value)) => Ok(value),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Serialize a frame as one line, including the trailing newline.
///
/// # Errors
///
/// Returns a serialization error if the frame cannot be encoded.
pub fn encode_line<T: Serialize>(frame: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_omits_absent_params() {
        let req = Request::call(7, "provisioner.ping", None);
        let line = encode_line(&req).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert!(!line.contains("params"));
        assert!(line.contains(r#""jsonrpc":"2.0""#));
    }

    #[test]
    fn test_response_success_into_result() {
        let resp: Response =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":{"message":"ok"}}"#).unwrap();
        assert_eq!(resp.id, Some(3));
        assert_eq!(resp.into_result().unwrap(), json!({"message": "ok"}));
    }

    #[test]
    fn test_response_error_into_result() {
        let resp: Response = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32000,"message":"no capacity"}}"#,
        )
        .unwrap();
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code, APPLICATION_ERROR);
        assert_eq!(err.message, "no capacity");
    }

    #[test]
    fn test_failure_with_unknown_id() {
        let resp = Response::failure(None, PARSE_ERROR, "bad json");
        let text = serde_json::to_string(&resp).unwrap();
        assert!(text.contains(r#""id":null"#));
    }
}
