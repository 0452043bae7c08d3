//! Concrete upstream adapters. Each one only knows its provider's event shapes; the shared
//! [`drive`] loop turns decoded provider events into the uniform fragment sequence.

pub mod anthropic;
pub mod openai;

use futures::StreamExt;

use crate::error::{CoreResult, RelayError};
use crate::http_client::SseEventStream;
use crate::model::Fragment;
use crate::stream::FragmentStream;

/// What one provider event means for the fragment sequence.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Chunk {
    Text(String),
    /// Bookkeeping event with no text (role headers, pings, usage).
    Skip,
    /// Provider's own end-of-stream marker.
    Done,
}

/// Run provider events through `parse` until the provider says it is done.
///
/// A body that ends without the provider's end marker was cut off, and is reported as a
/// `network` error rather than a normal completion.
pub(crate) fn drive<F>(provider: String, events: SseEventStream, parse: F) -> FragmentStream
where
    F: Fn(&str, &str) -> CoreResult<Chunk> + Send + 'static,
{
    let s = async_stream::stream! {
        let mut events = events;
        let mut finished = false;
        while let Some(ev) = events.next().await {
            let chunk = ev.and_then(|payload| parse(&provider, &payload));
            match chunk {
                Ok(Chunk::Text(text)) => yield Ok(Fragment::new(text)),
                Ok(Chunk::Skip) => {}
                Ok(Chunk::Done) => {
                    finished = true;
                    break;
                }
                Err(e) => {
                    yield Err(e);
                    finished = true;
                    break;
                }
            }
        }
        if !finished {
            yield Err(RelayError::network(&provider, "upstream closed the stream before completion"));
        }
    };
    Box::pin(s)
}

/// Parse one provider payload, or `None` (logged) when it is not the JSON we expect.
pub(crate) fn parse_event<T: serde::de::DeserializeOwned>(provider: &str, payload: &str) -> Option<T> {
    match serde_json::from_str::<T>(payload) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(provider, error = %e, "skipping undecodable upstream event");
            None
        }
    }
}
