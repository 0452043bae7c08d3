use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::stream::StreamState;

/// Provider-agnostic summary of one relay run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RelayTrace {
    /// Correlation id assigned to the request.
    pub request_id: Option<String>,

    /// Upstream name, e.g. "openai", "null".
    pub provider: Option<String>,

    /// Model identifier, e.g. "gpt-4o".
    pub model: Option<String>,

    /// Terminal state label: "completed", "aborted" or "failed".
    pub state: Option<String>,

    /// Fragments and body bytes handed to the downstream channel.
    pub fragments: u64,
    pub bytes: u64,
    pub heartbeats: u64,

    /// Whether the response went out as an SSE stream (false for pre-stream JSON errors).
    pub streamed: bool,

    pub latency_ms: Option<u64>,
    pub first_fragment_ms: Option<u64>,

    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl RelayTrace {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn request_id(mut self, rid: &str) -> Self {
        self.request_id = Some(rid.to_string());
        self
    }
    pub fn provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }
    pub fn model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }
    pub fn state(mut self, state: &StreamState) -> Self {
        self.state = Some(state.label().to_string());
        if let StreamState::Failed(reason) = state
            && self.error_message.is_none()
        {
            self.error_message = Some(reason.clone());
        }
        self
    }
    pub fn error(mut self, err: &RelayError) -> Self {
        self.error_kind = Some(match err {
            RelayError::Validation(_) => "validation".to_string(),
            RelayError::Upstream { kind, .. } => kind.as_str().to_string(),
            RelayError::Transport(_) => "transport".to_string(),
            RelayError::Decode(_) => "decode".to_string(),
            RelayError::Io(_) | RelayError::Other(_) => "internal".to_string(),
        });
        self.error_message = Some(err.client_message());
        self
    }
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }
}
