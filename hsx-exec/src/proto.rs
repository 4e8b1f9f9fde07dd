//! Control-channel wire types.
//!
//! Requests and responses are newline-delimited JSON objects. Requests
//! carry `{id, op, args}`; responses echo `id` with `ok` and either
//! `result` or `error{kind, message, details?}`. Events are pushed
//! asynchronously with `ev: true` and the envelope from the session layer.

use serde_derive::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Structured control-plane error kinds.
pub const SESSION_REQUIRED: &str = "session_required";
pub const VERSION_MISMATCH: &str = "version_mismatch";
pub const PID_LOCKED: &str = "pid_locked";
pub const HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";
pub const UNSUPPORTED_CATEGORY: &str = "unsupported_category";
pub const BAD_REQUEST: &str = "bad_request";
pub const NOT_FOUND: &str = "not_found";
pub const VM_ERROR: &str = "vm_error";

/// One decoded request line.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    /// Correlation id, echoed verbatim; out-of-order responses are allowed.
    #[serde(default)]
    pub id: Value,
    pub op: String,
    #[serde(default)]
    pub args: Value,
}

/// Structured RPC error.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct RpcError {
    pub kind: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl RpcError {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(BAD_REQUEST, message)
    }
}

/// Success response frame.
pub fn ok_frame(id: &Value, result: Value) -> Value {
    json!({ "id": id, "ok": true, "result": result })
}

/// Error response frame.
pub fn err_frame(id: &Value, error: &RpcError) -> Value {
    let mut body = json!({ "kind": error.kind, "message": error.message });
    if let Some(details) = &error.details {
        body["details"] = details.clone();
    }
    json!({ "id": id, "ok": false, "error": body })
}
