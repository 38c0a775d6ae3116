//! JSON-RPC 2.0 base types.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

/// JSON-RPC 2.0 request ID — either a string or integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl RequestId {
    /// The id as an unsigned counter value, if it is one.
    ///
    /// Ids produced by [`crate::RpcCoder`] are always non-negative numbers.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => u64::try_from(*n).ok(),
            Self::String(_) => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Server-assigned subscription id, as returned by a subscribe call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubscriptionId {
    String(String),
    Number(u64),
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Key under which a live subscription (or its orphaned notifications) is stored:
/// `<notification-method>::<subscription-id>`.
pub fn subscription_key(notification_method: &str, id: &SubscriptionId) -> String {
    format!("{notification_method}::{id}")
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 success response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Value,
}

/// JSON-RPC 2.0 error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    pub error: RpcError,
}

/// JSON-RPC 2.0 response (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Success(SuccessResponse),
    Error(ErrorResponse),
}

/// JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper constructors
// ─────────────────────────────────────────────────────────────────────────────

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Validate that this is a well-formed JSON-RPC 2.0 request.
    pub fn is_valid(&self) -> bool {
        self.jsonrpc == "2.0" && !self.method.is_empty()
    }
}

impl SuccessResponse {
    pub fn new(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result,
        }
    }
}

impl ErrorResponse {
    pub fn new(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            error,
        }
    }
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
        }
    }

    /// A subscription notification: `params` carries `subscription` and `result`.
    pub fn subscription(method: impl Into<String>, id: &SubscriptionId, result: Value) -> Self {
        Self::new(
            method,
            Some(serde_json::json!({
                "subscription": id,
                "result": result,
            })),
        )
    }
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self::Success(SuccessResponse::new(id, result))
    }

    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self::Error(ErrorResponse::new(id, error))
    }
}
