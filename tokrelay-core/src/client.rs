//! Client side of the relay: read an SSE response and hand text to a UI sink as it arrives.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreResult, RelayError};
use crate::model::GenerationRequest;
use crate::sse::{self, DecodeBuffer};
use crate::stream::StreamState;

pub const STOPPED_MARKER: &str = "[stopped by user]";
pub const INTERRUPTED_MARKER: &str = "[connection interrupted]";

/// How the request reaches the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// `POST` with a `{model, message, stream: true}` body.
    #[default]
    Post,
    /// EventSource style `GET ?prompt=&model=`.
    Get,
}

/// Receives streamed text. Called from the reader task, in read order.
pub trait FragmentSink: Send + 'static {
    fn on_fragment(&mut self, text: &str);

    fn on_state(&mut self, _state: &StreamState) {}
}

/// Sink that accumulates text and state transitions; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferSink {
    inner: Arc<Mutex<Buffered>>,
}

#[derive(Debug, Default)]
struct Buffered {
    text: String,
    states: Vec<StreamState>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        self.inner.lock().map(|b| b.text.clone()).unwrap_or_default()
    }

    pub fn states(&self) -> Vec<StreamState> {
        self.inner.lock().map(|b| b.states.clone()).unwrap_or_default()
    }
}

impl FragmentSink for BufferSink {
    fn on_fragment(&mut self, text: &str) {
        if let Ok(mut b) = self.inner.lock() {
            b.text.push_str(text);
        }
    }

    fn on_state(&mut self, state: &StreamState) {
        if let Ok(mut b) = self.inner.lock() {
            b.states.push(state.clone());
        }
    }
}

/// Data events the relay sends besides the sentinel.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireEvent {
    Text { text: String },
    Error { error: String },
}

/// Starts streams against one relay endpoint.
#[derive(Debug, Clone)]
pub struct ClientStreamReader {
    http: reqwest::Client,
    endpoint: String,
    transport: Transport,
}

impl ClientStreamReader {
    /// `endpoint` is the full stream URL, e.g. `http://127.0.0.1:8787/api/stream`.
    pub fn new(endpoint: impl Into<String>) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("tokrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Other(e.into()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            transport: Transport::default(),
        })
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Issue the request on a background task and stream into `sink`.
    pub fn start<S: FragmentSink>(&self, req: GenerationRequest, sink: S) -> StreamHandle {
        let token = CancellationToken::new();
        let reader = self.clone();
        let task = tokio::spawn(reader.run(req, sink, token.clone()));
        StreamHandle { token, task }
    }

    async fn run<S: FragmentSink>(self, req: GenerationRequest, mut sink: S, token: CancellationToken) -> StreamState {
        let mut state = StreamState::Idle;
        state.advance(StreamState::Streaming);
        sink.on_state(&state);

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => StreamState::Aborted,
            end = self.pump(&req, &mut sink) => end,
        };
        // The response (and its connection) is dropped with the pump future.

        match &outcome {
            StreamState::Aborted => {
                tracing::debug!("stream stopped by user");
                sink.on_fragment(&format!("\n{STOPPED_MARKER}"));
            }
            StreamState::Failed(reason) => {
                tracing::warn!(%reason, "stream failed");
                sink.on_fragment(&format!("\n{INTERRUPTED_MARKER}"));
            }
            _ => tracing::debug!("stream completed"),
        }
        state.advance(outcome);
        sink.on_state(&state);
        state
    }

    /// Read until the sentinel, an error event, or the end of the channel.
    async fn pump<S: FragmentSink>(&self, req: &GenerationRequest, sink: &mut S) -> StreamState {
        let builder = match self.transport {
            Transport::Post => self.http.post(&self.endpoint).json(&json!({
                "model": req.model,
                "message": req.prompt,
                "stream": true,
            })),
            Transport::Get => self
                .http
                .get(&self.endpoint)
                .query(&[("prompt", req.prompt.as_str()), ("model", req.model.as_str())]),
        };
        let builder = builder.header(http::header::ACCEPT, "text/event-stream");
        let builder = match &req.request_id {
            Some(id) => builder.header("x-request-id", id),
            None => builder,
        };

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => return StreamState::Failed(format!("request failed: {e}")),
        };
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<crate::error::ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            return StreamState::Failed(format!("{} {}", status.as_u16(), message));
        }

        let mut body = resp.bytes_stream();
        let mut buf = DecodeBuffer::new();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return StreamState::Failed(format!("read failed: {e}")),
            };
            for payload in buf.feed(&chunk) {
                if payload == sse::DONE {
                    return StreamState::Completed;
                }
                match decode_event(&payload) {
                    Ok(WireEvent::Text { text }) => sink.on_fragment(&text),
                    Ok(WireEvent::Error { error }) => return StreamState::Failed(error),
                    Err(e) => tracing::debug!(error = %e, "skipping event"),
                }
            }
        }
        let rest = buf.finish();
        if !rest.is_empty() {
            tracing::debug!(bytes = rest.len(), "discarding incomplete frame");
        }
        StreamState::Failed("connection closed".into())
    }
}

fn decode_event(payload: &str) -> CoreResult<WireEvent> {
    serde_json::from_str(payload).map_err(|e| RelayError::Decode(format!("{e}: {payload}")))
}

/// Handle to a running stream.
#[derive(Debug)]
pub struct StreamHandle {
    token: CancellationToken,
    task: JoinHandle<StreamState>,
}

impl StreamHandle {
    /// Abort the outbound call. Idempotent; a no-op once the stream has ended.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Token that cancels this stream, e.g. for a Ctrl-C handler.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the terminal state.
    pub async fn join(self) -> StreamState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => StreamState::Failed(format!("reader task failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn frames(parts: &[&str]) -> String {
        parts
            .iter()
            .map(|p| format!("data: {p}\n\n"))
            .collect::<String>()
    }

    #[test]
    fn wire_events_decode() {
        assert!(matches!(
            decode_event(r#"{"text":"hi"}"#).unwrap(),
            WireEvent::Text { text } if text == "hi"
        ));
        assert!(matches!(
            decode_event(r#"{"error":"boom"}"#).unwrap(),
            WireEvent::Error { error } if error == "boom"
        ));
        assert!(matches!(decode_event("not json"), Err(RelayError::Decode(_))));
    }

    #[tokio::test]
    async fn post_stream_completes_and_skips_bad_events() {
        let server = MockServer::start();
        let body = format!(
            ": keep-alive\n\n{}",
            frames(&[r#"{"text":"He"}"#, "garbage", r#"{"text":"llo"}"#, "[DONE]", r#"{"text":"late"}"#])
        );
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/api/stream")
                .body_contains("\"message\":\"hi\"")
                .body_contains("\"stream\":true");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(body);
        });

        let sink = BufferSink::new();
        let reader = ClientStreamReader::new(server.url("/api/stream")).unwrap();
        let state = reader
            .start(GenerationRequest::new("hi", "echo"), sink.clone())
            .join()
            .await;
        assert_eq!(state, StreamState::Completed);
        assert_eq!(sink.text(), "Hello");
        assert_eq!(sink.states(), vec![StreamState::Streaming, StreamState::Completed]);
        m.assert();
    }

    #[tokio::test]
    async fn get_transport_uses_query() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(GET)
                .path("/api/stream")
                .query_param("prompt", "hi there")
                .query_param("model", "echo");
            then.status(200).body(frames(&[r#"{"text":"ok"}"#, "[DONE]"]));
        });
        let sink = BufferSink::new();
        let reader = ClientStreamReader::new(server.url("/api/stream"))
            .unwrap()
            .with_transport(Transport::Get);
        let state = reader
            .start(GenerationRequest::new("hi there", "echo"), sink.clone())
            .join()
            .await;
        assert_eq!(state, StreamState::Completed);
        assert_eq!(sink.text(), "ok");
        m.assert();
    }

    #[tokio::test]
    async fn error_event_fails_with_marker() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/api/stream");
            then.status(200).body(frames(&[r#"{"text":"a"}"#, r#"{"error":"policy"}"#]));
        });
        let sink = BufferSink::new();
        let state = ClientStreamReader::new(server.url("/api/stream"))
            .unwrap()
            .start(GenerationRequest::new("hi", "m"), sink.clone())
            .join()
            .await;
        assert_eq!(state, StreamState::Failed("policy".into()));
        assert_eq!(sink.text(), format!("a\n{INTERRUPTED_MARKER}"));
    }

    #[tokio::test]
    async fn missing_sentinel_is_connection_closed() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/api/stream");
            then.status(200).body(format!("{}data: {{\"text\":\"dangl", frames(&[r#"{"text":"a"}"#])));
        });
        let sink = BufferSink::new();
        let state = ClientStreamReader::new(server.url("/api/stream"))
            .unwrap()
            .start(GenerationRequest::new("hi", "m"), sink.clone())
            .join()
            .await;
        assert_eq!(state, StreamState::Failed("connection closed".into()));
        assert!(sink.text().starts_with('a'));
    }

    #[tokio::test]
    async fn http_error_status_reports_server_message() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/api/stream");
            then.status(500)
                .header("content-type", "application/json")
                .body(r#"{"error":"connection refused"}"#);
        });
        let state = ClientStreamReader::new(server.url("/api/stream"))
            .unwrap()
            .start(GenerationRequest::new("hi", "m"), BufferSink::new())
            .join()
            .await;
        assert_eq!(state, StreamState::Failed("500 connection refused".into()));
    }

    #[tokio::test]
    async fn cancel_before_response_is_aborted_not_failed() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/api/stream");
            then.status(200)
                .delay(Duration::from_secs(2))
                .body(frames(&["[DONE]"]));
        });
        let sink = BufferSink::new();
        let handle = ClientStreamReader::new(server.url("/api/stream"))
            .unwrap()
            .start(GenerationRequest::new("hi", "m"), sink.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        handle.cancel();
        assert_eq!(handle.join().await, StreamState::Aborted);
        assert_eq!(sink.text(), format!("\n{STOPPED_MARKER}"));
        assert!(!sink.states().iter().any(|s| matches!(s, StreamState::Failed(_))));
    }
}
