//! tokrelay: relay incremental LLM output to browsers and terminals over Server-Sent Events.

pub mod client;
pub mod config;
pub mod error;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod provider_factory;
pub mod providers;
pub mod relay;
pub mod router;
pub mod server;
pub mod sse;
pub mod stream;
pub mod telemetry;
pub mod upstream;

pub use error::{CoreResult, RelayError, UpstreamErrorKind};
pub use model::{Fragment, GenerationRequest};
pub use relay::Relay;
pub use stream::StreamState;
