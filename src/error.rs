//! Error types for the session runtime.

use std::io;

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime errors, covering every kind named in the error taxonomy plus the
/// ambient IO/JSON/HTTP/config failures every crate area needs.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (bad value, missing required key).
    #[error("configuration error: {0}")]
    Config(String),

    /// A session id was empty or whitespace-only.
    #[error("session id is empty")]
    SessionIdEmpty,

    /// A session was found but is past `expiresAt` or `maxLifetimeAt`.
    #[error("session expired")]
    SessionExpired,

    /// A client or session exceeded its read-rate-limit bucket.
    #[error("session read rate-limited")]
    SessionRateLimited,

    /// A bearer token failed validation (malformed, wrong issuer, etc).
    #[error("invalid token")]
    InvalidToken,

    /// An operation needed a `providerId` and none was supplied or resolvable.
    #[error("no provider id supplied")]
    NoProviderId,

    /// Orchestrated authorization requires a token vault and none was wired up.
    #[error("token vault required for orchestrated authorization")]
    TokenStoreRequired,

    /// No usable access/refresh token was available after an attempted refresh.
    #[error("token not available")]
    TokenNotAvailable,

    /// Skill Guard denied the call outright (strict mode, not on allowlist).
    #[error("tool not allowed: {0}")]
    ToolNotAllowed(String),

    /// Skill Guard requires an approval that has not been granted.
    #[error("tool approval required: {0}")]
    ToolApprovalRequired(String),

    /// The Flow Registry had no flow matching the request.
    #[error("no flow found for request")]
    FlowNotFound,

    /// A flow run was cancelled via the context's cancel signal.
    #[error("flow cancelled")]
    FlowCancelled,

    /// The Storage Adapter's backend connection failed.
    #[error("storage connection error: {0}")]
    StorageConnection(String),

    /// The Storage Adapter was misconfigured.
    #[error("storage configuration error: {0}")]
    StorageConfig(String),

    /// An AES-GCM tag failed to verify; the offending blob has been deleted.
    #[error("crypto tag mismatch")]
    CryptoTagMismatch,

    /// Transport-level error (framing, cold-start recreation).
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON-RPC error surfaced with an explicit code/message/data triple.
    #[error("json-rpc error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional structured data
        data: Option<serde_json::Value>,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error (Redis REST backend, OAuth refresh calls)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown in progress
    #[error("server shutdown")]
    Shutdown,

    /// Catch-all for invariants that should never be reachable.
    #[error("internal error: {0}")]
    Internal(String),

    /// The active backend does not implement this capability.
    #[error("{0} not supported by this backend")]
    Unsupported(&'static str),
}

impl Error {
    /// Construct a JSON-RPC error with no structured data.
    #[must_use]
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Map this error onto a JSON-RPC error code per §6/§7 of the error
    /// taxonomy. Authorization/policy errors never leak a stack trace or a
    /// token value through this mapping — only the variant's own message.
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::SessionIdEmpty
            | Self::NoProviderId
            | Self::FlowNotFound
            | Self::Config(_)
            | Self::StorageConfig(_) => rpc_codes::INVALID_PARAMS,
            Self::SessionExpired
            | Self::SessionRateLimited
            | Self::InvalidToken
            | Self::TokenStoreRequired
            | Self::TokenNotAvailable
            | Self::ToolNotAllowed(_)
            | Self::ToolApprovalRequired(_) => rpc_codes::SERVER_ERROR_START,
            Self::FlowCancelled => rpc_codes::SERVER_ERROR_START - 1,
            Self::StorageConnection(_) => rpc_codes::SERVER_ERROR_START - 2,
            Self::CryptoTagMismatch => rpc_codes::SERVER_ERROR_START - 3,
            Self::Transport(_) => rpc_codes::SERVER_ERROR_START - 4,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// The machine-readable "kind" surfaced on the response envelope,
    /// independent of the numeric RPC code.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionIdEmpty
            | Self::Config(_)
            | Self::NoProviderId
            | Self::FlowNotFound
            | Self::Json(_) => "validation",
            Self::SessionExpired
            | Self::SessionRateLimited
            | Self::InvalidToken
            | Self::TokenStoreRequired
            | Self::TokenNotAvailable => "authorization",
            Self::StorageConnection(_) | Self::StorageConfig(_) => "storage",
            Self::CryptoTagMismatch => "crypto",
            Self::ToolNotAllowed(_) | Self::ToolApprovalRequired(_) => "policy",
            Self::FlowCancelled => "cancelled",
            _ => "internal",
        }
    }
}

/// Standard JSON-RPC error codes.
pub mod rpc_codes {
    /// Parse error - invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
    /// Server error range end
    pub const SERVER_ERROR_END: i32 = -32099;
}
