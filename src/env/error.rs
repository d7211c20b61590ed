//! Error types for the environment client
//!
//! Domain errors are `thiserror` enums. Every failure a caller can observe
//! funnels into [`EnvError`]; backend-reported failures are normalized into a
//! [`BackendErrorKind`] so callers never parse dialect-specific error text.

use std::time::Duration;
use thiserror::Error;

use super::adapter::Dialect;
use super::envelope::RequestId;

/// Top-level environment client error
#[derive(Debug, Clone, Error)]
pub enum EnvError {
    /// Attempted to send while the connection is not in the Connected state
    #[error("not connected")]
    NotConnected,

    /// The connection closed while the request was outstanding
    #[error("connection lost: {reason}")]
    ConnectionLost {
        /// Why the connection closed
        reason: String,
    },

    /// The backend reported a failure
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// An inbound frame or response body could not be understood
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No response arrived within the allotted time
    #[error("request {request_id} timed out after {after:?}")]
    Timeout {
        /// Identifier of the expired request
        request_id: RequestId,
        /// Configured timeout
        after: Duration,
    },

    /// The request was cancelled before a response arrived
    #[error("request cancelled")]
    Cancelled,

    /// The active dialect has no equivalent for this operation
    #[error("operation '{operation}' is not supported by the {dialect} backend")]
    Unsupported {
        /// Abstract operation name
        operation: &'static str,
        /// Active dialect
        dialect: Dialect,
    },

    /// The environment is read-only and the operation modifies it
    #[error("permission denied: '{operation}' requires write access")]
    PermissionDenied {
        /// Abstract operation name
        operation: &'static str,
    },

    /// Login was attempted without credentials
    #[error("no credentials available for login")]
    MissingCredentials,

    /// The connection lifecycle does not allow the requested transition
    #[error("invalid connection state: {0}")]
    InvalidState(String),

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration problem
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EnvError {
    /// The normalized backend error kind, if this is a backend error.
    pub fn backend_kind(&self) -> Option<BackendErrorKind> {
        match self {
            EnvError::Backend(err) => Some(err.kind),
            _ => None,
        }
    }

    /// Convenience constructor for [`EnvError::ConnectionLost`].
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        EnvError::ConnectionLost {
            reason: reason.into(),
        }
    }
}

/// Normalized classification of backend-reported failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    /// The entity being created already exists
    AlreadyExists,
    /// The referenced entity does not exist
    NotFound,
    /// Authentication or authorization failed
    Unauthorized,
    /// The backend does not implement the request
    NotImplemented,
    /// Anything else
    Other,
}

/// Backend failure surfaced to the caller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    /// Normalized kind
    pub kind: BackendErrorKind,
    /// Backend message, kept for display
    pub message: String,
    /// Backend error code when the dialect provides one
    pub code: Option<String>,
}

impl BackendError {
    /// Build a backend error, classifying it from its code and message.
    pub fn classify(message: impl Into<String>, code: Option<String>) -> Self {
        let message = message.into();
        let kind = classify_backend_error(code.as_deref(), &message);
        Self {
            kind,
            message,
            code,
        }
    }
}

/// Map a backend error code and message onto a [`BackendErrorKind`].
///
/// Codes win over message text; message matching is case-insensitive.
pub fn classify_backend_error(code: Option<&str>, message: &str) -> BackendErrorKind {
    if let Some(code) = code {
        match code {
            "not found" => return BackendErrorKind::NotFound,
            "unauthorized access" => return BackendErrorKind::Unauthorized,
            "already exists" => return BackendErrorKind::AlreadyExists,
            "not implemented" => return BackendErrorKind::NotImplemented,
            _ => {}
        }
    }

    let lowered = message.to_ascii_lowercase();
    if lowered.contains("already exists") {
        BackendErrorKind::AlreadyExists
    } else if lowered.contains("not found") {
        BackendErrorKind::NotFound
    } else if lowered.contains("unauthorized")
        || lowered.contains("invalid user or password")
        || lowered.contains("invalid entity name or password")
        || lowered.contains("permission denied")
    {
        BackendErrorKind::Unauthorized
    } else if lowered.contains("not implemented") || lowered.contains("not supported") {
        BackendErrorKind::NotImplemented
    } else {
        BackendErrorKind::Other
    }
}

/// Malformed inbound data
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame was not valid JSON
    #[error("invalid json: {0}")]
    InvalidJson(String),

    /// Frame was JSON but not an object
    #[error("frame is not a json object")]
    NotAnObject,

    /// Correlation id present but not an unsigned integer
    #[error("invalid request id: {0}")]
    InvalidRequestId(String),

    /// Response body lacked an expected field
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Transport-level failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Could not open the channel
    #[error("failed to connect to {url}: {reason}")]
    ConnectFailed {
        /// Target URL
        url: String,
        /// Underlying error text
        reason: String,
    },

    /// The channel is gone
    #[error("transport closed")]
    Closed,
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The socket URL could not be parsed
    #[error("invalid socket url '{url}': {reason}")]
    InvalidUrl {
        /// Offending URL
        url: String,
        /// Parser message
        reason: String,
    },

    /// The socket URL uses a scheme the client cannot open
    #[error("unsupported socket url scheme '{0}'")]
    UnsupportedScheme(String),

    /// Unknown dialect name
    #[error("unknown backend dialect '{0}' (expected 'go' or 'python')")]
    UnknownDialect(String),

    /// Reading or writing the config file failed
    #[error("config file error: {0}")]
    File(String),
}

/// Result type using EnvError
pub type Result<T> = std::result::Result<T, EnvError>;
