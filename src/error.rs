//! Response Error Taxonomy
//!
//! Failures the worker reports back through the bus. Each kind maps to a
//! retryability verdict and an HTTP status for the facade:
//!
//! | Kind | Retryable | HTTP |
//! |------|-----------|------|
//! | `validation` | no | 400 |
//! | `not_found` | no | 404 |
//! | `session_not_ready` | yes | 503 |
//! | `upstream_refused` | no | 400 |
//! | `upstream_transient` | yes | 503 |
//! | `internal` | no | 500 |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::UpstreamError;
use crate::models::{CommandResponse, RequestId};

/// Failure classification carried in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller-supplied command is malformed; never retried.
    Validation,
    /// The referenced entity does not exist.
    NotFound,
    /// Worker is reconnecting or degraded; retry later.
    SessionNotReady,
    /// Upstream returned a business error; surfaced verbatim.
    UpstreamRefused,
    /// Upstream timeout, disconnect, or token skew; retry later.
    UpstreamTransient,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorKind {
    /// Whether the caller may retry the same command.
    #[must_use]
    pub const fn retryable(self) -> bool {
        matches!(self, Self::SessionNotReady | Self::UpstreamTransient)
    }

    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::SessionNotReady => "session_not_ready",
            Self::UpstreamRefused => "upstream_refused",
            Self::UpstreamTransient => "upstream_transient",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure on its way to becoming a `failed` response.
#[derive(Debug, Clone, Error)]
#[error("[{kind}] {message}")]
pub struct ResponseError {
    /// Classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl ResponseError {
    /// Create a classified error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Malformed caller input.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Missing entity.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Session is not ready to serve commands.
    #[must_use]
    pub fn session_not_ready(state: &str) -> Self {
        Self::new(
            ErrorKind::SessionNotReady,
            format!("session not ready (state: {state})"),
        )
    }

    /// Unexpected internal failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Whether the caller may retry.
    #[must_use]
    pub const fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    /// Convert into the `failed` response for a request.
    #[must_use]
    pub fn into_response(self, request_id: impl Into<RequestId>) -> CommandResponse {
        CommandResponse::failed(request_id, self.kind, self.message)
    }
}

impl From<UpstreamError> for ResponseError {
    fn from(err: UpstreamError) -> Self {
        let kind = match &err {
            e if e.is_transient() => ErrorKind::UpstreamTransient,
            UpstreamError::ContractNotFound(_) | UpstreamError::OrderNotFound(_) => {
                ErrorKind::NotFound
            }
            _ => ErrorKind::UpstreamRefused,
        };
        Self::new(kind, err.to_string())
    }
}
