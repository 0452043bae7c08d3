use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{CoreResult, RelayError};
use crate::http_client::{HttpClient, RequestCtx};
use crate::model::GenerationRequest;
use crate::providers::{Chunk, drive, parse_event};
use crate::stream::FragmentStream;
use crate::upstream::UpstreamAdapter;

pub const OPENAI_BASE: &str = "https://api.openai.com";
pub const OPENROUTER_BASE: &str = "https://openrouter.ai/api";

/// Any provider speaking the OpenAI chat-completions streaming dialect
/// (OpenAI itself, OpenRouter, local gateways).
#[derive(Debug, Clone)]
pub struct OpenAiCompatible {
    http: HttpClient,
    base: String,
    name: String,
    api_key: SecretString,
}

impl OpenAiCompatible {
    pub fn new(
        http: HttpClient,
        api_key: SecretString,
        base: String,
        name: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_key,
            base,
            name: name.into(),
        }
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        OpenAiCompatible::new(
            HttpClient::new_default().unwrap(),
            SecretString::new("test-key".into()),
            server_base.to_string(),
            "openai",
        )
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key.expose_secret()),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]
    }
}

// ---- Wire structs (minimal) ----
#[derive(Serialize)]
struct OAChatReq<'a> {
    model: &'a str,
    messages: [OAMessage<'a>; 1],
    stream: bool,
}

#[derive(Serialize)]
struct OAMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OAStreamChunk {
    #[serde(default)]
    choices: Vec<OAStreamChoice>,
    #[serde(default)]
    error: Option<OAError>,
}

#[derive(Deserialize)]
struct OAStreamChoice {
    #[serde(default)]
    delta: Option<OADelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OADelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OAError {
    #[serde(default)]
    message: String,
}

fn parse_chunk(provider: &str, payload: &str) -> CoreResult<Chunk> {
    if payload.trim() == crate::sse::DONE {
        return Ok(Chunk::Done);
    }
    let Some(chunk) = parse_event::<OAStreamChunk>(provider, payload) else {
        return Ok(Chunk::Skip);
    };
    if let Some(err) = chunk.error {
        return Err(RelayError::provider(provider, err.message));
    }
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(Chunk::Skip);
    };
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(RelayError::provider(
            provider,
            "response blocked by the provider's content policy",
        ));
    }
    match choice.delta.and_then(|d| d.content) {
        Some(text) if !text.is_empty() => Ok(Chunk::Text(text)),
        _ => Ok(Chunk::Skip),
    }
}

#[async_trait]
impl UpstreamAdapter for OpenAiCompatible {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(
        &self,
        req: GenerationRequest,
        _cancel: CancellationToken,
    ) -> CoreResult<FragmentStream> {
        let payload = OAChatReq {
            model: &req.model,
            messages: [OAMessage {
                role: "user",
                content: &req.prompt,
            }],
            stream: true,
        };
        let ctx = RequestCtx {
            request_id: req.request_id.as_deref(),
        };
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let url = format!("{}/v1/chat/completions", self.base);
        let events = self
            .http
            .post_sse(&self.name, &url, &payload, &hdrs, &ctx)
            .await?;
        Ok(drive(self.name.clone(), events, parse_chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamErrorKind;
    use crate::model::Fragment;
    use futures::StreamExt;
    use httpmock::Method::POST;
    use httpmock::MockServer;

    fn sse_body(events: &[&str]) -> String {
        events.iter().map(|e| format!("data: {e}\n\n")).collect()
    }

    async fn run(provider: &OpenAiCompatible) -> Vec<CoreResult<Fragment>> {
        let s = provider
            .open(GenerationRequest::new("hello", "gpt-4o"), CancellationToken::new())
            .await
            .expect("open ok");
        s.collect().await
    }

    #[tokio::test]
    async fn streams_delta_content() {
        let server = MockServer::start();
        let provider = OpenAiCompatible::new_for_tests(&server.base_url());
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer test-key")
                .body_contains("\"stream\":true")
                .body_contains("\"content\":\"hello\"");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&[
                    r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
                    r#"{"choices":[{"delta":{"content":"He"}}]}"#,
                    r#"{"choices":[{"delta":{"content":"llo"}}]}"#,
                    r#"{"choices":[{"delta":{"content":" there"},"finish_reason":null}]}"#,
                    r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
                    "[DONE]",
                ]));
        });

        let texts: Vec<String> = run(&provider)
            .await
            .into_iter()
            .map(|r| r.unwrap().text)
            .collect();
        assert_eq!(texts, vec!["He", "llo", " there"]);
        m.assert();
    }

    #[tokio::test]
    async fn content_filter_is_provider_error() {
        let server = MockServer::start();
        let provider = OpenAiCompatible::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body(sse_body(&[
                r#"{"choices":[{"delta":{"content":"par"}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"content_filter"}]}"#,
            ]));
        });
        let items = run(&provider).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().text, "par");
        let err = items[1].as_ref().err().unwrap();
        assert_eq!(err.upstream_kind(), Some(UpstreamErrorKind::Provider));
    }

    #[tokio::test]
    async fn error_event_is_provider_error() {
        let server = MockServer::start();
        let provider = OpenAiCompatible::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .body(sse_body(&[r#"{"error":{"message":"model overloaded"}}"#]));
        });
        let items = run(&provider).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().err().unwrap().client_message(), "model overloaded");
    }

    #[tokio::test]
    async fn garbage_events_are_skipped() {
        let server = MockServer::start();
        let provider = OpenAiCompatible::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body(sse_body(&[
                "not json",
                r#"{"choices":[{"delta":{"content":"ok"}}]}"#,
                "[DONE]",
            ]));
        });
        let items = run(&provider).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().text, "ok");
    }

    #[tokio::test]
    async fn missing_done_is_network_error() {
        let server = MockServer::start();
        let provider = OpenAiCompatible::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .body(sse_body(&[r#"{"choices":[{"delta":{"content":"A"}}]}"#]));
        });
        let items = run(&provider).await;
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1].as_ref().err().unwrap().upstream_kind(),
            Some(UpstreamErrorKind::Network)
        );
    }

    #[tokio::test]
    async fn status_401_fails_open() {
        let server = MockServer::start();
        let provider = OpenAiCompatible::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(401).body("bad key");
        });
        let err = provider
            .open(GenerationRequest::new("hi", "gpt-4o"), CancellationToken::new())
            .await
            .err()
            .expect("should fail");
        assert_eq!(err.upstream_kind(), Some(UpstreamErrorKind::Provider));
        assert!(err.client_message().contains("bad key"));
    }

    #[tokio::test]
    async fn network_error_fails_open() {
        let provider = OpenAiCompatible::new_for_tests("http://127.0.0.1:9");
        let err = provider
            .open(GenerationRequest::new("hi", "gpt-4o"), CancellationToken::new())
            .await
            .err()
            .expect("should fail");
        assert_eq!(err.upstream_kind(), Some(UpstreamErrorKind::Network));
    }
}
