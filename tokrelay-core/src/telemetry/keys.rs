/// Span/log attribute keys for relay runs.
/// Keep these stable; log queries and dashboards filter on them.
pub const KEY_REQUEST_ID: &str = "req.id";
pub const KEY_PROVIDER: &str = "llm.provider";
pub const KEY_MODEL: &str = "llm.model";

pub const KEY_STATE: &str = "relay.state";
pub const KEY_FRAGMENTS: &str = "relay.fragments";
