use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreResult, RelayError, UpstreamErrorKind};
use crate::model::{Fragment, GenerationRequest};
use crate::stream::FragmentStream;

/// A token-generating completion API.
///
/// `open` issues exactly one outbound request and returns the lazy fragment sequence. There is
/// no retry inside an adapter; calling `open` again is the only way to restart.
#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn open(
        &self,
        req: GenerationRequest,
        cancel: CancellationToken,
    ) -> CoreResult<FragmentStream>;
}

/// Open `adapter` under `cancel`.
///
/// The handshake races the token, and the returned sequence is wrapped by [`guard`], so a fired
/// token stops both connecting and yielding.
pub async fn open(
    adapter: &dyn UpstreamAdapter,
    req: GenerationRequest,
    cancel: CancellationToken,
) -> CoreResult<FragmentStream> {
    let name = adapter.name().to_string();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RelayError::aborted(name)),
        res = adapter.open(req, cancel.clone()) => res.map(|s| guard(name, s, cancel)),
    }
}

/// Enforce the sequence contract on top of a raw adapter stream:
/// - nothing is yielded once `cancel` has fired, and the inner stream is dropped right away;
/// - an `aborted` error caused by our own cancellation ends the sequence silently;
/// - the first error is the last item.
pub fn guard(provider: String, inner: FragmentStream, cancel: CancellationToken) -> FragmentStream {
    let s = async_stream::stream! {
        let mut inner = inner;
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = inner.next() => item,
            };
            match item {
                None => break,
                Some(Ok(fragment)) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    yield Ok(fragment);
                }
                Some(Err(e)) => {
                    if e.upstream_kind() == Some(UpstreamErrorKind::Aborted) && cancel.is_cancelled() {
                        tracing::trace!(%provider, "absorbed abort after cancellation");
                    } else {
                        yield Err(e);
                    }
                    break;
                }
            }
        }
        drop(inner);
    };
    Box::pin(s)
}

#[derive(Debug, Clone)]
enum Script {
    /// Echo the prompt back word by word.
    Echo,
    Fixed(Vec<String>),
}

/// In-process upstream that plays back a script. Registered as `null`; also the test double.
#[derive(Debug, Clone)]
pub struct Scripted {
    name: String,
    script: Script,
    delay: Option<Duration>,
    fail_on_open: Option<(UpstreamErrorKind, String)>,
    fail_after: Option<(UpstreamErrorKind, String)>,
    probe: Arc<Probe>,
}

/// Counters shared between a [`Scripted`] adapter and the test observing it.
#[derive(Debug, Default)]
pub struct Probe {
    opens: AtomicUsize,
    emitted: AtomicUsize,
    last_token: Mutex<Option<CancellationToken>>,
}

impl Probe {
    /// Number of `open` calls.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Fragments actually produced across all opens.
    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }

    /// Whether the token passed to the most recent `open` has fired.
    pub fn was_cancelled(&self) -> bool {
        self.last_token
            .lock()
            .map(|t| t.as_ref().is_some_and(|t| t.is_cancelled()))
            .unwrap_or(false)
    }
}

impl Scripted {
    pub fn echo() -> Self {
        Self::with_script("null", Script::Echo)
    }

    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(
            "scripted",
            Script::Fixed(fragments.into_iter().map(Into::into).collect()),
        )
    }

    fn with_script(name: &str, script: Script) -> Self {
        Self {
            name: name.to_string(),
            script,
            delay: None,
            fail_on_open: None,
            fail_after: None,
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Pause before each fragment.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the `open` call itself.
    pub fn fail_on_open(mut self, kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        self.fail_on_open = Some((kind, message.into()));
        self
    }

    /// Yield this error after the scripted fragments instead of ending normally.
    pub fn fail_after(mut self, kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        self.fail_after = Some((kind, message.into()));
        self
    }

    pub fn probe(&self) -> Arc<Probe> {
        self.probe.clone()
    }
}

fn scripted_error(provider: &str, kind: UpstreamErrorKind, message: &str) -> RelayError {
    RelayError::Upstream {
        kind,
        provider: provider.to_string(),
        message: message.to_string(),
        retry_after: None,
    }
}

#[async_trait]
impl UpstreamAdapter for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(
        &self,
        req: GenerationRequest,
        cancel: CancellationToken,
    ) -> CoreResult<FragmentStream> {
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut slot) = self.probe.last_token.lock() {
            *slot = Some(cancel.clone());
        }
        if let Some((kind, msg)) = &self.fail_on_open {
            return Err(scripted_error(&self.name, *kind, msg));
        }

        let fragments = match &self.script {
            Script::Echo => req.prompt.split_inclusive(' ').map(str::to_string).collect(),
            Script::Fixed(list) => list.clone(),
        };
        let delay = self.delay;
        let tail = self
            .fail_after
            .clone()
            .map(|(kind, msg)| scripted_error(&self.name, kind, &msg));
        let probe = self.probe.clone();

        let s = async_stream::stream! {
            for text in fragments {
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                probe.emitted.fetch_add(1, Ordering::SeqCst);
                yield Ok(Fragment::new(text));
            }
            if let Some(err) = tail {
                yield Err(err);
            }
        };
        Ok(Box::pin(s))
    }
}
