use std::fmt;

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an upstream token stream stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamErrorKind {
    /// Connect, send, or body read failed.
    Network,
    /// Provider answered with an error status, an error event, or a policy rejection.
    Provider,
    /// The caller cancelled the stream.
    Aborted,
}

impl UpstreamErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Provider => "provider",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type for tokrelay.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("upstream {kind} error from {provider}: {message}")]
    Upstream {
        kind: UpstreamErrorKind,
        provider: String,
        message: String,
        retry_after: Option<u64>,
    },

    /// The downstream channel went away while a frame was being written.
    #[error("transport closed: {0}")]
    Transport(String),

    #[error("undecodable event payload: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn network(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            kind: UpstreamErrorKind::Network,
            provider: provider.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            kind: UpstreamErrorKind::Provider,
            provider: provider.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn aborted(provider: impl Into<String>) -> Self {
        Self::Upstream {
            kind: UpstreamErrorKind::Aborted,
            provider: provider.into(),
            message: "cancelled by caller".into(),
            retry_after: None,
        }
    }

    /// Upstream kind, if this is an upstream error.
    pub fn upstream_kind(&self) -> Option<UpstreamErrorKind> {
        match self {
            Self::Upstream { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// True for errors that only mean "somebody hung up": caller aborts and closed transports.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Transport(_)) || self.upstream_kind() == Some(UpstreamErrorKind::Aborted)
    }

    /// HTTP status used when this error is reported before the stream starts.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to the client in an `{error}` body or frame.
    pub fn client_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::Upstream { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// `{ "error": string }`, used both as a pre-stream JSON body and a mid-stream data event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.client_message(),
        };
        (self.status(), Json(body)).into_response()
    }
}
