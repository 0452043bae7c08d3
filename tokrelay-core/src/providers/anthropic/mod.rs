use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{CoreResult, RelayError},
    http_client::{HttpClient, RequestCtx},
    model::GenerationRequest,
    providers::{Chunk, drive, parse_event},
    stream::FragmentStream,
    upstream::UpstreamAdapter,
};

pub const ANTHROPIC_BASE: &str = "https://api.anthropic.com";

/// Default Anthropic API version header required by the Messages API.
const ANTHROPIC_API_VERSION: &str = "2023-06-01";

/// The Messages API requires an explicit output cap.
const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct Anthropic {
    http: HttpClient,
    api_key: SecretString,
    base: String,
    name: String,
}

impl Anthropic {
    pub fn new(http: HttpClient, api_key: SecretString, base: String) -> Self {
        Self {
            http,
            api_key,
            base,
            name: "anthropic".into(),
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "x-api-key".to_string(),
                self.api_key.expose_secret().to_string(),
            ),
            (
                "anthropic-version".to_string(),
                ANTHROPIC_API_VERSION.to_string(),
            ),
        ]
    }
}

// ===== Anthropic wire types (Messages API, streaming) =====

#[derive(Serialize)]
struct AMsgReq<'a> {
    model: &'a str,
    messages: [AMessage<'a>; 1],
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct AMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AEvent {
    ContentBlockDelta { delta: ADelta },
    MessageStop,
    Error { error: AErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ADelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct AErrorBody {
    #[serde(default)]
    message: String,
}

fn parse_event_payload(provider: &str, payload: &str) -> CoreResult<Chunk> {
    let Some(ev) = parse_event::<AEvent>(provider, payload) else {
        return Ok(Chunk::Skip);
    };
    match ev {
        AEvent::ContentBlockDelta { delta } => match delta.text {
            Some(text) if !text.is_empty() => Ok(Chunk::Text(text)),
            _ => Ok(Chunk::Skip),
        },
        AEvent::MessageStop => Ok(Chunk::Done),
        AEvent::Error { error } => Err(RelayError::provider(provider, error.message)),
        AEvent::Other => Ok(Chunk::Skip),
    }
}

#[async_trait]
impl UpstreamAdapter for Anthropic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(
        &self,
        req: GenerationRequest,
        _cancel: CancellationToken,
    ) -> CoreResult<FragmentStream> {
        let payload = AMsgReq {
            model: &req.model,
            messages: [AMessage {
                role: "user",
                content: &req.prompt,
            }],
            max_tokens: DEFAULT_MAX_TOKENS,
            stream: true,
        };

        let url = format!("{}/v1/messages", self.base);
        let ctx = RequestCtx {
            request_id: req.request_id.as_deref(),
        };
        let headers = self.headers();
        let header_pairs: Vec<(&str, &str)> = headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let events = self
            .http
            .post_sse(&self.name, &url, &payload, &header_pairs, &ctx)
            .await?;
        Ok(drive(self.name.clone(), events, parse_event_payload))
    }
}
