//! Error taxonomy and JSON-RPC 2.0 error objects.

use serde::{Deserialize, Serialize};

/// Standard JSON-RPC 2.0 error codes plus chainmux errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // JSON-RPC 2.0 standard errors
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,

    // Multiplexer errors
    AlreadyDestroyed,
    Crash,
    JsonRpcDisabled,
    NotConnected,
    Disconnected,
    AlreadyAttached,
    NotAttached,
    UnknownSubscription,
    UnknownChain,
    InvalidChainSpec,
    ManagerDestroyed,

    // Custom code
    Custom(i32),
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::AlreadyDestroyed => -32010,
            Self::Crash => -32011,
            Self::JsonRpcDisabled => -32012,
            Self::NotConnected => -32013,
            Self::Disconnected => -32014,
            Self::AlreadyAttached => -32015,
            Self::NotAttached => -32016,
            Self::UnknownSubscription => -32017,
            Self::UnknownChain => -32018,
            Self::InvalidChainSpec => -32019,
            Self::ManagerDestroyed => -32020,
            Self::Custom(c) => *c,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32010 => Self::AlreadyDestroyed,
            -32011 => Self::Crash,
            -32012 => Self::JsonRpcDisabled,
            -32013 => Self::NotConnected,
            -32014 => Self::Disconnected,
            -32015 => Self::AlreadyAttached,
            -32016 => Self::NotAttached,
            -32017 => Self::UnknownSubscription,
            -32018 => Self::UnknownChain,
            -32019 => Self::InvalidChainSpec,
            -32020 => Self::ManagerDestroyed,
            c => Self::Custom(c),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error [{}]: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Every failure a provider, relay or connection manager can report.
///
/// Engine errors are translated into this taxonomy at the provider boundary,
/// so no engine-specific error type ever reaches a caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MuxError {
    #[error("the chain has already been destroyed")]
    AlreadyDestroyed,

    #[error("the engine crashed: {0}")]
    Crash(String),

    #[error("JSON-RPC is disabled for this chain")]
    JsonRpcDisabled,

    #[error("the chain is not connected")]
    NotConnected,

    #[error("the chain was disconnected")]
    Disconnected,

    #[error("app {app} is already attached to {chain}")]
    AlreadyAttached { app: String, chain: String },

    #[error("app {app} is not attached to {chain}")]
    NotAttached { app: String, chain: String },

    #[error("unable to find active subscription {0}")]
    UnknownSubscription(String),

    #[error("malformed JSON-RPC message: {0}")]
    Decode(String),

    #[error("unknown chain: {0}")]
    UnknownChain(String),

    #[error("invalid chain spec: {0}")]
    InvalidChainSpec(String),

    #[error("connection manager does not exist")]
    ManagerDestroyed,

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl MuxError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::AlreadyDestroyed => ErrorCode::AlreadyDestroyed,
            Self::Crash(_) => ErrorCode::Crash,
            Self::JsonRpcDisabled => ErrorCode::JsonRpcDisabled,
            Self::NotConnected => ErrorCode::NotConnected,
            Self::Disconnected => ErrorCode::Disconnected,
            Self::AlreadyAttached { .. } => ErrorCode::AlreadyAttached,
            Self::NotAttached { .. } => ErrorCode::NotAttached,
            Self::UnknownSubscription(_) => ErrorCode::UnknownSubscription,
            Self::Decode(_) => ErrorCode::ParseError,
            Self::UnknownChain(_) => ErrorCode::UnknownChain,
            Self::InvalidChainSpec(_) => ErrorCode::InvalidChainSpec,
            Self::ManagerDestroyed => ErrorCode::ManagerDestroyed,
            Self::Rpc(e) => e.error_code(),
        }
    }

    /// The JSON-RPC error object reported to an app for this failure.
    ///
    /// Errors returned by the chain itself are passed through untouched.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Self::Rpc(e) => e.clone(),
            other => RpcError::new(other.error_code(), other.to_string()),
        }
    }
}
