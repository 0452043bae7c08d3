use serde::{Deserialize, Serialize};

/// One user submission. Built once per request and never mutated afterwards.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
    /// Correlation id for logs and telemetry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            request_id: None,
        }
    }
}

/// One incremental unit of generated text.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
}

impl Fragment {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl From<&str> for Fragment {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Fragment {
    fn from(text: String) -> Self {
        Self { text }
    }
}

/// Request bodies accepted by the relay endpoint.
///
/// Two shapes are in circulation: the plain `{prompt}` form and the chat-style
/// `{model, message, stream: true}` form.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum SubmitBody {
    Chat {
        model: String,
        message: String,
        #[serde(default)]
        stream: Option<bool>,
    },
    Prompt {
        prompt: String,
        #[serde(default)]
        model: Option<String>,
    },
}

impl SubmitBody {
    /// Convert into a request; a missing model is left empty for the normalizer to fill.
    pub fn into_request(self) -> GenerationRequest {
        match self {
            Self::Chat { model, message, .. } => GenerationRequest::new(message, model),
            Self::Prompt { prompt, model } => {
                GenerationRequest::new(prompt, model.unwrap_or_default())
            }
        }
    }
}

/// Query string for the GET (EventSource) transport.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct SubmitQuery {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
}

impl From<SubmitQuery> for GenerationRequest {
    fn from(q: SubmitQuery) -> Self {
        GenerationRequest::new(q.prompt, q.model.unwrap_or_default())
    }
}
