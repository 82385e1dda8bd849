// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("tool server transport error: {0}")]
    Transport(String),

    #[error("tool server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("tool server protocol violation: {0}")]
    Protocol(String),

    #[error("failed to start tool server '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    pub fn new(id: i64, method: impl Into<String>, params: Value) -> Self {
        Self { jsonrpc: "2.0", id, method: method.into(), params }
    }
}

/// A request without an id — the receiver must not reply.
#[derive(Debug, Serialize)]
pub struct Notification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { jsonrpc: "2.0", method: method.into(), params }
    }
}

#[derive(Debug, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Response {
    /// Whether this response answers the request with the given id.
    pub fn answers(&self, id: i64) -> bool {
        matches!(&self.id, Some(v) if v.as_i64() == Some(id))
    }

    pub fn into_result(self) -> Result<Value, McpError> {
        if let Some(err) = self.error {
            return Err(McpError::Server { code: err.code, message: err.message });
        }
        self.result.ok_or_else(|| McpError::Protocol("response with neither result nor error".into()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_to_jsonrpc_2() {
        let r = Request::new(7, "tools/list", Value::Null);
        let v: Value = serde_json::from_str(&serde_json::to_string(&r).unwrap()).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 7);
        assert_eq!(v["method"], "tools/list");
        assert!(v.get("params").is_none(), "null params are omitted");
    }

    #[test]
    fn notification_has_no_id() {
        let n = Notification::new("notifications/initialized", Value::Null);
        let v: Value = serde_json::from_str(&serde_json::to_string(&n).unwrap()).unwrap();
        assert!(v.get("id").is_none());
    }

    #[test]
    fn response_result_round_trip() {
        let raw = r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#;
        let resp: Response = serde_json::from_str(raw).unwrap();
        assert!(resp.answers(3));
        assert!(!resp.answers(4));
        assert_eq!(resp.into_result().unwrap()["ok"], true);
    }

    #[test]
    fn response_error_maps_to_server_error() {
        let raw = r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"no such method"}}"#;
        let resp: Response = serde_json::from_str(raw).unwrap();
        let err = resp.into_result().unwrap_err();
        assert!(matches!(err, McpError::Server { code: -32601, .. }));
    }

    #[test]
    fn response_without_result_or_error_is_protocol_violation() {
        let raw = r#"{"jsonrpc":"2.0","id":3}"#;
        let resp: Response = serde_json::from_str(raw).unwrap();
        assert!(matches!(resp.into_result(), Err(McpError::Protocol(_))));
    }

    #[test]
    fn request_with_params_keeps_them() {
        let r = Request::new(1, "tools/call", json!({"name": "echo"}));
        let v: Value = serde_json::from_str(&serde_json::to_string(&r).unwrap()).unwrap();
        assert_eq!(v["params"]["name"], "echo");
    }
}
