//! JSON-RPC 2.0 envelope types shared by the stdio transport.
//!
//! The transport treats message bodies as opaque except for classification:
//! an incoming payload is a request (has `method` and `id`), a response (has
//! `id` and one of `result`/`error`), or a notification (has `method`, no
//! `id`). [`classify`] implements that discrimination.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 reserved code for server-side failures.
pub const INTERNAL_ERROR: i64 = -32603;

pub const JSONRPC_VERSION: &str = "2.0";

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

/// A request id: a non-empty string or a signed 64-bit integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Canonical form used to key the correlation table: integers render as
    /// their decimal string, strings are used as-is.
    pub fn key(&self) -> String {
        match self {
            RequestId::Number(n) => n.to_string(),
            RequestId::String(s) => s.clone(),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    /// `None` on an outbound request means the transport assigns an id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// An error response with code [`INTERNAL_ERROR`].
    pub fn internal_error(id: RequestId, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code: INTERNAL_ERROR,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            method: method.into(),
            params,
        }
    }
}

/// A classified incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// Probe shape used to reject request-like payloads that fell through the
/// typed request parse but still carry an `id` member.
#[derive(Deserialize)]
struct NotificationProbe {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

fn contains_token(payload: &[u8], token: &[u8]) -> bool {
    payload.windows(token.len()).any(|w| w == token)
}

/// Classify a raw payload as a request, response, or notification.
///
/// The `"method"`/`"id"` token scan is only a cheap gate before the typed
/// request parse; the typed parses are authoritative. Returns `None` when the
/// payload matches no envelope; callers log and discard those.
pub fn classify(payload: &[u8]) -> Option<Incoming> {
    if contains_token(payload, b"\"method\"") && contains_token(payload, b"\"id\"") {
        if let Ok(req) = serde_json::from_slice::<JsonRpcRequest>(payload) {
            if req.id.is_some() {
                return Some(Incoming::Request(req));
            }
        }
    }

    if let Ok(resp) = serde_json::from_slice::<JsonRpcResponse>(payload) {
        if resp.result.is_some() || resp.error.is_some() {
            return Some(Incoming::Response(resp));
        }
    }

    if let Ok(probe) = serde_json::from_slice::<NotificationProbe>(payload) {
        if probe.id.is_none() {
            return Some(Incoming::Notification(JsonRpcNotification {
                jsonrpc: default_jsonrpc(),
                method: probe.method,
                params: probe.params,
            }));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn id_keys_are_canonical() {
        assert_eq!(RequestId::Number(42).key(), "42");
        assert_eq!(RequestId::Number(-7).key(), "-7");
        assert_eq!(RequestId::String("req-3".into()).key(), "req-3");
    }

    #[test]
    fn id_deserializes_both_shapes() {
        let n: RequestId = serde_json::from_str("17").expect("number id");
        assert_eq!(n, RequestId::Number(17));
        let s: RequestId = serde_json::from_str("\"abc\"").expect("string id");
        assert_eq!(s, RequestId::String("abc".into()));
    }

    #[test]
    fn classifies_request() {
        let raw = br#"{"jsonrpc":"2.0","id":1,"method":"ping","params":{}}"#;
        match classify(raw) {
            Some(Incoming::Request(req)) => {
                assert_eq!(req.method, "ping");
                assert_eq!(req.id, Some(RequestId::Number(1)));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn classifies_response() {
        let raw = br#"{"jsonrpc":"2.0","id":"req-1","result":"pong"}"#;
        match classify(raw) {
            Some(Incoming::Response(resp)) => {
                assert_eq!(resp.id, RequestId::String("req-1".into()));
                assert_eq!(resp.result, Some(json!("pong")));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_error_response() {
        let raw = br#"{"jsonrpc":"2.0","id":4,"error":{"code":-32603,"message":"boom"}}"#;
        match classify(raw) {
            Some(Incoming::Response(resp)) => {
                assert!(resp.is_error());
                assert_eq!(resp.error.map(|e| e.code), Some(INTERNAL_ERROR));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_notification() {
        let raw = br#"{"jsonrpc":"2.0","method":"progress","params":{"pct":50}}"#;
        match classify(raw) {
            Some(Incoming::Notification(note)) => assert_eq!(note.method, "progress"),
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn token_scan_in_params_does_not_misclassify() {
        // Both tokens appear, but only inside params; the typed parse decides.
        let raw = br#"{"jsonrpc":"2.0","method":"log","params":{"method":"x","id":"y"}}"#;
        match classify(raw) {
            Some(Incoming::Notification(note)) => assert_eq!(note.method, "log"),
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(classify(b"hello"), None);
        assert_eq!(classify(br#"{"jsonrpc":"2.0"}"#), None);
        // id present but no method/result/error: not any envelope.
        assert_eq!(classify(br#"{"jsonrpc":"2.0","id":1}"#), None);
    }

    #[test]
    fn response_serializes_without_null_members() {
        let resp = JsonRpcResponse::success(RequestId::Number(1), json!("ok"));
        let raw = serde_json::to_string(&resp).expect("serialize");
        assert!(!raw.contains("error"));
        let err = JsonRpcResponse::internal_error(RequestId::Number(2), "nope");
        let raw = serde_json::to_string(&err).expect("serialize");
        assert!(!raw.contains("result"));
        assert!(raw.contains("-32603"));
    }

    #[test]
    fn request_without_id_serializes_as_notification_shape() {
        let req = JsonRpcRequest::new("ping", None);
        let raw = serde_json::to_string(&req).expect("serialize");
        assert!(!raw.contains("\"id\""));
    }
}
