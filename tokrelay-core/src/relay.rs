//! The streaming relay: one upstream fragment sequence in, one SSE response out.
//!
//! Lifecycle per request:
//! `Idle → Streaming → {Completed | Aborted | Failed}`.
//!
//! The response body is fed through a bounded channel. The relay task owns the only sender, so
//! writes are strictly FIFO, a full channel is backpressure, and the channel closing (the
//! server dropped the body because the client went away) is the disconnect signal. The inbound
//! request body plays no part in disconnect detection.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use http::HeaderValue;
use http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::error::{CoreResult, ErrorBody, RelayError};
use crate::model::GenerationRequest;
use crate::normalizer::normalize_request;
use crate::provider_factory::UpstreamRegistry;
use crate::router::RoutingResolver;
use crate::sse;
use crate::stream::{FragmentStream, StreamState, UpstreamItem};
use crate::telemetry::{self, RelayTrace};
use crate::upstream;

pub const EVENT_STREAM: &str = "text/event-stream; charset=utf-8";

/// Tunables for the relay loop.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub heartbeat: Duration,
    pub channel_capacity: usize,
    pub default_model: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RelaySettings {
    fn from(cfg: &Config) -> Self {
        Self {
            heartbeat: Duration::from_secs(cfg.server.heartbeat_secs.max(1)),
            channel_capacity: cfg.server.channel_capacity.max(1),
            default_model: cfg.server.default_model.clone(),
        }
    }
}

pub struct Relay {
    registry: UpstreamRegistry,
    router: RoutingResolver,
    settings: RelaySettings,
    next_id: AtomicU64,
}

impl Relay {
    pub fn new(registry: UpstreamRegistry, router: RoutingResolver, settings: RelaySettings) -> Self {
        Self {
            registry,
            router,
            settings,
            next_id: AtomicU64::new(1),
        }
    }

    /// Build the registry and routing from config.
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        let registry = UpstreamRegistry::from_config(cfg)?;
        let router = RoutingResolver::new(cfg)?;
        tracing::info!(upstreams = ?registry.names(), default = %cfg.routing.default, "relay configured");
        Ok(Self::new(registry, router, RelaySettings::from(cfg)))
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Handle one submission and produce the HTTP response for it.
    ///
    /// Errors found before the upstream is connected (validation, routing, open failure) become a
    /// JSON `{error}` response with status 400 or 500. Once `open` succeeds the SSE headers are
    /// committed and heartbeats run while waiting for the first fragment; everything later is
    /// reported inside the event stream.
    pub async fn submit(&self, mut req: GenerationRequest) -> Response {
        let request_id = req
            .request_id
            .clone()
            .unwrap_or_else(|| format!("req-{}", self.next_id.fetch_add(1, Ordering::Relaxed)));
        req.request_id = Some(request_id.clone());

        let span = tracing::info_span!(
            "relay",
            req.id = tracing::field::Empty,
            llm.provider = tracing::field::Empty,
            llm.model = tracing::field::Empty,
            relay.state = tracing::field::Empty,
            relay.fragments = tracing::field::Empty,
        );
        span.record(telemetry::KEY_REQUEST_ID, request_id.as_str());
        let started = Instant::now();

        let Opened {
            provider,
            model,
            token,
            stream,
        } = match self.open(req).instrument(span.clone()).await {
            Ok(opened) => opened,
            Err(Rejected { err, provider, model }) => {
                let _enter = span.enter();
                let state = StreamState::Failed(err.client_message());
                span.record(telemetry::KEY_STATE, state.label());
                match &err {
                    RelayError::Validation(msg) => tracing::info!(reason = %msg, "request rejected"),
                    other => tracing::warn!(error = %other, "upstream failed before streaming"),
                }
                let mut trace = RelayTrace::new()
                    .request_id(&request_id)
                    .error(&err)
                    .state(&state)
                    .latency_ms(started.elapsed().as_millis() as u64);
                trace.provider = provider;
                trace.model = model;
                telemetry::emit(trace);
                return err.into_response();
            }
        };

        let (tx, mut rx) = mpsc::channel::<Bytes>(self.settings.channel_capacity);
        let run = RelayRun {
            tx,
            token,
            heartbeat: self.settings.heartbeat,
            started,
            trace: RelayTrace::new()
                .request_id(&request_id)
                .provider(&provider)
                .model(&model),
        };
        tokio::spawn(run.drive(stream).instrument(span));

        let body = async_stream::stream! {
            while let Some(frame) = rx.recv().await {
                yield Ok::<Bytes, Infallible>(frame);
            }
        };
        let mut resp = Response::new(Body::from_stream(body));
        let headers = resp.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(EVENT_STREAM));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache, no-transform"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        if let Ok(v) = HeaderValue::from_str(&request_id) {
            headers.insert("x-request-id", v);
        }
        resp
    }

    /// Validate, route and open the upstream.
    ///
    /// The token is armed with a drop guard until the stream is handed to the relay task: if the
    /// client disconnects during the handshake, the handler future is dropped and the upstream is
    /// cancelled with it.
    async fn open(&self, req: GenerationRequest) -> Result<Opened, Rejected> {
        let req = normalize_request(req, &self.settings.default_model).map_err(Rejected::bare)?;
        let model = req.model.clone();
        let adapter = self.router.select(&self.registry, &model).map_err(|err| Rejected {
            err,
            provider: None,
            model: Some(model.clone()),
        })?;
        let provider = adapter.name().to_string();
        let span = tracing::Span::current();
        span.record(telemetry::KEY_PROVIDER, provider.as_str());
        span.record(telemetry::KEY_MODEL, model.as_str());
        tracing::debug!("opening upstream");

        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        let fail = |err| Rejected {
            err,
            provider: Some(provider.clone()),
            model: Some(model.clone()),
        };

        let stream = upstream::open(adapter.as_ref(), req, token.clone())
            .await
            .map_err(fail)?;
        guard.disarm();
        Ok(Opened {
            provider,
            model,
            token,
            stream,
        })
    }
}

/// A connected upstream, not yet polled.
struct Opened {
    provider: String,
    model: String,
    token: CancellationToken,
    stream: FragmentStream,
}

/// A request that failed before any body byte was committed.
struct Rejected {
    err: RelayError,
    provider: Option<String>,
    model: Option<String>,
}

impl Rejected {
    fn bare(err: RelayError) -> Self {
        Self {
            err,
            provider: None,
            model: None,
        }
    }
}

/// State owned by the spawned task that writes one response body.
struct RelayRun {
    tx: mpsc::Sender<Bytes>,
    token: CancellationToken,
    heartbeat: Duration,
    started: Instant,
    trace: RelayTrace,
}

impl RelayRun {
    async fn drive(mut self, mut stream: FragmentStream) {
        let mut state = StreamState::Streaming;
        tracing::debug!("streaming");

        // Ticks from submission, so the wait for the first fragment is covered too.
        let mut ticker = tokio::time::interval_at(self.started + self.heartbeat, self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let item: Option<UpstreamItem> = tokio::select! {
                biased;
                _ = self.tx.closed() => {
                    self.abort(&mut state, "client disconnected");
                    break;
                }
                _ = ticker.tick() => {
                    if self.write(sse::encode_heartbeat()).await.is_err() {
                        self.abort(&mut state, "client disconnected during heartbeat");
                        break;
                    }
                    self.trace.heartbeats += 1;
                    continue;
                }
                item = stream.next() => item,
            };

            match item {
                Some(Ok(fragment)) => {
                    if self.trace.fragments == 0 {
                        self.trace.first_fragment_ms = Some(self.started.elapsed().as_millis() as u64);
                    }
                    let frame = match sse::encode_json(&fragment) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::error!(error = %e, "fragment could not be framed");
                            state.advance(StreamState::Failed(e.client_message()));
                            break;
                        }
                    };
                    if self.write(frame).await.is_err() {
                        self.abort(&mut state, "client disconnected mid-write");
                        break;
                    }
                    self.trace.fragments += 1;
                }
                None => {
                    if self.write(sse::encode_sentinel()).await.is_err() {
                        self.abort(&mut state, "client disconnected before sentinel");
                    } else {
                        state.advance(StreamState::Completed);
                    }
                    break;
                }
                Some(Err(e)) if e.is_cancellation() && self.token.is_cancelled() => {
                    self.abort(&mut state, "upstream aborted after cancellation");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, kind = ?e.upstream_kind(), "upstream failed mid-stream");
                    let body = ErrorBody { error: e.client_message() };
                    if let Ok(frame) = sse::encode_json(&body) {
                        // Best effort: the status line is already committed.
                        let _ = self.write(frame).await;
                    }
                    self.trace = std::mem::take(&mut self.trace).error(&e);
                    state.advance(StreamState::Failed(e.client_message()));
                    break;
                }
            }
        }

        // Dropping the stream closes the upstream transport; dropping the sender ends the body.
        drop(stream);
        drop(self.tx);
        let latency = self.started.elapsed().as_millis() as u64;
        let mut trace = self.trace.state(&state).latency_ms(latency);
        trace.streamed = true;
        let span = tracing::Span::current();
        span.record(telemetry::KEY_STATE, state.label());
        span.record(telemetry::KEY_FRAGMENTS, trace.fragments);
        tracing::info!(
            state = state.label(),
            fragments = trace.fragments,
            bytes = trace.bytes,
            heartbeats = trace.heartbeats,
            latency_ms = latency,
            "relay finished"
        );
        telemetry::emit(trace);
    }

    /// Queue one frame, waiting for channel capacity. Fails only if the body was dropped.
    async fn write(&mut self, frame: Bytes) -> CoreResult<()> {
        let len = frame.len() as u64;
        self.tx
            .send(frame)
            .await
            .map_err(|_| RelayError::Transport("response body dropped".into()))?;
        self.trace.bytes += len;
        Ok(())
    }

    /// Client is gone: fire the token so the upstream stops, and record `Aborted`.
    fn abort(&self, state: &mut StreamState, why: &str) {
        self.token.cancel();
        if state.advance(StreamState::Aborted) {
            tracing::info!(reason = why, "stream aborted");
        }
    }
}
