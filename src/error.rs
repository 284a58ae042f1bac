//! Unified error handling for the hivefarm crate
//!
//! This module provides a single `Error` enum wrapping all failure modes of
//! the farm, together with the failure classification that drives the retry
//! and proxy-rotation policy.
//!
//! # Architecture
//!
//! - [`Error`] - Unified error enum used across module boundaries
//! - [`ApiError`] - Structured error recognized in a task-service response
//! - [`FailureClass`] - Classification of a failure for retry strategies
//!
//! Classification follows a simple rule: transport-shaped failures
//! (connection, timeout, DNS, TLS, proxy authentication) are worth retrying
//! on a fresh proxy; recognized business responses and validation failures
//! are not; everything else is fatal for the current attempt only.

use std::io;
use thiserror::Error;

/// Business errors the task service is known to return.
///
/// The service reports these as plain message strings inside an otherwise
/// well-formed JSON body; matching is by message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
    /// Privacy policy has not been accepted for this account
    PolicyNotAccepted,
    /// Session credential is no longer valid
    LoggedOut,
    /// Account suspended by the service
    AccountSuspended,
    /// Registration collision
    EmailAlreadyExists,
    /// Client version no longer accepted; wait for synchronization
    ClientUpgradeRequired,
    /// Recognized error envelope with an unrecognized message
    Other,
}

impl ApiErrorKind {
    /// Match a service error message to a known kind.
    pub fn from_message(message: &str) -> Self {
        let msg = message.to_lowercase();
        if msg.contains("privacy policy") {
            Self::PolicyNotAccepted
        } else if msg.contains("loged out") || msg.contains("logged out") {
            Self::LoggedOut
        } else if msg.contains("suspended") {
            Self::AccountSuspended
        } else if msg.contains("already exist") {
            Self::EmailAlreadyExists
        } else if msg.contains("upgrade is required") {
            Self::ClientUpgradeRequired
        } else {
            Self::Other
        }
    }
}

/// Structured error extracted from a task-service response body
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApiError {
    /// Raw error message from the response
    pub message: String,
    /// Recognized error kind, if any
    pub kind: ApiErrorKind,
}

impl ApiError {
    /// Create an API error from a response message.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = ApiErrorKind::from_message(&message);
        Self { message, kind }
    }
}

/// Unified error type for the hivefarm crate
#[derive(Error, Debug)]
pub enum Error {
    /// Recognized business error returned by the task service
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// HTTP client error (connection, TLS, protocol)
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    /// Transport failure surfaced as a message (proxy tunnels, DNS, resets)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server-side error status
    #[error("Server error: {0}")]
    ServerError(u16),

    /// Request rate limited by the service
    #[error("Rate limit exceeded, retry in {reset_secs}s")]
    RateLimited { reset_secs: u64 },

    /// Wall-clock timeout on an operation
    #[error("Operation timed out")]
    Timeout,

    /// Non-retryable validation failure
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database errors
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML rule-document errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Classification of a failure for retry handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Transport-shaped: worth retrying after rotating the proxy
    Rotatable,
    /// Recognized business or validation failure: rotation will not help
    NonRotatable,
    /// Unexpected failure: abandon the attempt, log, stay eligible
    Fatal,
}

/// Message fragments that identify transport-class failures.
const TRANSPORT_KEYWORDS: &[&str] = &[
    "connection",
    "connect",
    "timeout",
    "timed out",
    "dns",
    "unreachable",
    "refused",
    "reset",
    "ssl",
    "tls",
    "tunnel",
    "proxy authentication",
    "407",
];

/// Message fragments that identify non-rotatable business failures.
const BUSINESS_KEYWORDS: &[&str] = &[
    "already exist",
    "invalid credentials",
    "unauthorized",
    "not allowed",
    "validation",
];

/// Classify an opaque error message.
///
/// Used when the failure reaches us as text only (e.g. through an
/// `anyhow::Error` boundary). Business keywords win over transport keywords
/// so that messages carrying both shapes do not trigger a pointless rotation.
pub fn classify_message(message: &str) -> FailureClass {
    let msg = message.to_lowercase();

    if BUSINESS_KEYWORDS.iter().any(|k| msg.contains(k)) {
        return FailureClass::NonRotatable;
    }
    if TRANSPORT_KEYWORDS.iter().any(|k| msg.contains(k)) {
        return FailureClass::Rotatable;
    }
    FailureClass::Fatal
}

impl Error {
    /// Classify this error for the retry policy.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Api(_) | Self::Validation(_) => FailureClass::NonRotatable,
            Self::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    FailureClass::Rotatable
                } else {
                    classify_message(&e.to_string())
                }
            }
            Self::Transport(_)
            | Self::ServerError(_)
            | Self::RateLimited { .. }
            | Self::Timeout => FailureClass::Rotatable,
            Self::Store(_) | Self::Json(_) | Self::Yaml(_) | Self::Config(_) => {
                FailureClass::Fatal
            }
            Self::Io(_) => FailureClass::Rotatable,
            Self::Other { context, .. } => classify_message(context),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err)
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_refused_is_rotatable() {
        assert_eq!(
            classify_message("connection refused by remote host"),
            FailureClass::Rotatable
        );
    }

    #[test]
    fn test_already_exist_is_non_rotatable() {
        assert_eq!(
            classify_message("Email already exist!!"),
            FailureClass::NonRotatable
        );
    }

    #[test]
    fn test_unknown_message_is_fatal() {
        assert_eq!(
            classify_message("something completely different"),
            FailureClass::Fatal
        );
    }

    #[test]
    fn test_proxy_auth_is_rotatable() {
        assert_eq!(
            classify_message("Proxy Authentication Required (407)"),
            FailureClass::Rotatable
        );
    }

    #[test]
    fn test_api_error_kind_matching() {
        assert_eq!(
            ApiError::new("Email already exist!!").kind,
            ApiErrorKind::EmailAlreadyExists
        );
        assert_eq!(
            ApiError::new("Client upgrade is required").kind,
            ApiErrorKind::ClientUpgradeRequired
        );
        assert_eq!(ApiError::new("some new message").kind, ApiErrorKind::Other);
    }

    #[test]
    fn test_error_class_variants() {
        assert_eq!(
            Error::Api(ApiError::new("You have been loged out!")).class(),
            FailureClass::NonRotatable
        );
        assert_eq!(Error::Timeout.class(), FailureClass::Rotatable);
        assert_eq!(Error::ServerError(502).class(), FailureClass::Rotatable);
        assert_eq!(
            Error::Validation("bad input".into()).class(),
            FailureClass::NonRotatable
        );
        assert_eq!(Error::config("missing key").class(), FailureClass::Fatal);
    }
}
