//! Error types for the gateway client.

use std::time::Duration;

use crate::types::RegisterErrorCode;

/// Gateway client errors.
///
/// Every lower-level failure (gRPC status, TLS, lock store) is translated into
/// one of these variants before it reaches the caller.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Static misconfiguration detected before any network I/O.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A DID document failed local validation and was never sent.
    #[error("invalid DID document field `{field}`: {reason}")]
    InvalidDocument { field: &'static str, reason: String },

    /// An attempt exceeded its deadline. Never retried.
    #[error("registration timed out after {timeout:?}: {message}")]
    Timeout { timeout: Duration, message: String },

    /// The gateway could not be reached.
    #[error("gateway unavailable: {message}")]
    Connection { message: String },

    /// DID registration quota exceeded for the caller.
    #[error("DID registration quota exceeded: {message}")]
    QuotaExceeded { message: String },

    /// The gateway rejected the request with an application error code.
    #[error("gateway rejected request ({code}): {message}")]
    Response {
        code: RegisterErrorCode,
        message: String,
    },

    /// Exhausted retries or an unclassified remote failure.
    ///
    /// `transient` is set when the underlying condition was one the backoff
    /// engine retries (INTERNAL, PROCESSING_ERROR, ...).
    #[error("gateway error: {message}")]
    Gateway { message: String, transient: bool },
}

impl GatewayError {
    /// Stable machine-readable code for branching and log correlation.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "E_CONFIG",
            Self::InvalidDocument { .. } => "E_INVALID_DOCUMENT",
            Self::Timeout { .. } => "E_TIMEOUT",
            Self::Connection { .. } => "E_CONNECTION",
            Self::QuotaExceeded { .. } => "E_QUOTA_EXCEEDED",
            Self::Response { .. } => "E_RESPONSE",
            Self::Gateway { .. } => "E_GATEWAY",
        }
    }

    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            // Caller-side problems
            Self::Config { .. } => 1,
            Self::InvalidDocument { .. } => 1,

            // Rejected by the gateway
            Self::Response { .. } => 2,
            Self::QuotaExceeded { .. } => 3,

            // Network/transient
            Self::Timeout { .. } => 5,
            Self::Connection { .. } => 5,

            // Other
            Self::Gateway { .. } => 6,
        }
    }

    /// Whether a later call may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Gateway { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Application error code, if the gateway supplied one.
    pub fn register_code(&self) -> Option<RegisterErrorCode> {
        match self {
            Self::Response { code, .. } => Some(*code),
            Self::QuotaExceeded { .. } => Some(RegisterErrorCode::DidQuotaExceeded),
            _ => None,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<tonic::transport::Error> for GatewayError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Connection {
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::Connection {
            message: format!("lock store: {}", err),
        }
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
