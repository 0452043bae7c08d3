//! Streaming primitives shared by the relay and the client reader.
//!
//! Contract:
//! - An upstream yields 0..n `Ok(Fragment)` items and then either ends (normal completion)
//!   or yields exactly one `Err` and ends.
//! - After cancellation fires, no further fragments are yielded.
//! - `StreamState` moves `Idle → Streaming → {Completed | Aborted | Failed}` and never leaves a
//!   terminal state.

use std::fmt;

use crate::error::CoreResult;
use crate::model::Fragment;

/// Lifecycle of one generation, tracked independently by each side of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming,
    Completed,
    Aborted,
    Failed(String),
}

impl StreamState {
    /// Returns true once the stream can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed(_))
    }

    /// Short label for logs and telemetry.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Failed(_) => "failed",
        }
    }

    /// Move to `next` unless already terminal. Returns whether the move happened.
    pub fn advance(&mut self, next: StreamState) -> bool {
        if self.is_terminal() {
            return false;
        }
        *self = next;
        true
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Item produced by an upstream adapter.
pub type UpstreamItem = CoreResult<Fragment>;

/// Boxed lazy fragment sequence. Dropping it closes the underlying transport.
pub type FragmentStream = futures::stream::BoxStream<'static, UpstreamItem>;
