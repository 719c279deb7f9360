//! Error types for the AccelMCP gateway

use std::io;

use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// MCP Service could not be resolved from the request
    #[error("MCP service not found: {0}")]
    ServiceNotFound(String),

    /// Bearer token missing or not mapped to an account
    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    /// A permission tier denied the call
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid or missing JSON-RPC params
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Persistence layer error
    #[error("Store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::InvalidParams(_) => rpc_codes::INVALID_PARAMS,
            Self::Unauthenticated(_) => rpc_codes::AUTHENTICATION_REQUIRED,
            Self::PermissionDenied(_) => rpc_codes::PERMISSION_DENIED,
            Self::ServiceNotFound(_) => rpc_codes::SERVICE_NOT_FOUND,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// JSON-RPC error codes used by the gateway
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Missing or invalid bearer token on a restricted service
    pub const AUTHENTICATION_REQUIRED: i32 = -32001;
    /// A permission tier denied access
    pub const PERMISSION_DENIED: i32 = -32003;
    /// No enabled MCP service matched the request
    pub const SERVICE_NOT_FOUND: i32 = -32004;
}
