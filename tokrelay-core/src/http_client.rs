use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::Stream;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::config::HttpCfg;
use crate::error::{CoreResult, RelayError, UpstreamErrorKind};
use crate::sse::DecodeBuffer;

/// Request context carries tracing IDs.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub request_id: Option<&'a str>,
}

type ByteStream =
    Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::new(&HttpCfg::default())
    }

    /// Build a client from config. No total request timeout is applied: a generation may
    /// legitimately stream for longer than any fixed bound.
    pub fn new(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| RelayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("tokrelay/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    /// POST JSON and return the SSE payload stream of the response.
    ///
    /// Errors before the body starts (connect failure, non-2xx) are returned here; errors while
    /// reading the body surface as a `network` item on the stream, after which it ends.
    pub async fn post_sse<T: Serialize + ?Sized>(
        &self,
        provider: &str,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<SseEventStream> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream");

        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| RelayError::network(provider, format!("request failed: {e}")))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        if !status.is_success() {
            let ra = parse_retry_after(&headers);
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(provider, status, ra, &body));
        }
        if let Some(prid) = extract_request_id(&headers) {
            tracing::debug!(provider, provider_request_id = %prid, "upstream stream opened");
        }

        Ok(SseEventStream::new(provider, Box::pin(resp.bytes_stream())))
    }
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 4] = ["x-request-id", "request-id", "x-amzn-requestid", "cf-ray"];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k)
            && let Ok(s) = v.to_str()
        {
            return Some(s.to_string());
        }
    }
    None
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

fn map_http_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> RelayError {
    RelayError::Upstream {
        kind: UpstreamErrorKind::Provider,
        provider: provider.to_string(),
        message: format!("{} {}", status.as_u16(), truncate(body, 300)),
        retry_after: if status == StatusCode::TOO_MANY_REQUESTS {
            retry_after
        } else {
            None
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut t = s[..end].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}

/// SSE payloads decoded from a response body, one item per complete event.
pub struct SseEventStream {
    inner: ByteStream,
    provider: String,
    buf: DecodeBuffer,
    ready: std::collections::VecDeque<String>,
    done: bool,
}

impl SseEventStream {
    fn new(provider: &str, inner: ByteStream) -> Self {
        Self {
            inner,
            provider: provider.to_string(),
            buf: DecodeBuffer::new(),
            ready: Default::default(),
            done: false,
        }
    }
}

impl Stream for SseEventStream {
    type Item = CoreResult<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(payload) = self.ready.pop_front() {
                return Poll::Ready(Some(Ok(payload)));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let frames = self.buf.feed(&chunk);
                    self.ready.extend(frames);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    let err = RelayError::network(&self.provider, format!("body read failed: {e}"));
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    // A trailing partial event is never a frame.
                    if !self.buf.is_empty() {
                        tracing::debug!(
                            provider = %self.provider,
                            leftover = self.buf.len(),
                            "upstream body ended mid-event"
                        );
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
