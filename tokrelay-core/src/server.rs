//! HTTP surface for the relay.

use std::future::Future;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use http::HeaderMap;
use tokio::net::TcpListener;

use crate::error::{CoreResult, RelayError};
use crate::model::{GenerationRequest, SubmitBody, SubmitQuery};
use crate::relay::Relay;

pub const STREAM_PATH: &str = "/api/stream";
pub const HEALTH_PATH: &str = "/healthz";

/// Routes: `POST|GET /api/stream` and `GET /healthz`.
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route(STREAM_PATH, get(stream_get).post(stream_post))
        .route(HEALTH_PATH, get(healthz))
        .with_state(relay)
}

/// Serve until `shutdown` resolves. In-flight streams are drained before returning.
pub async fn serve<F>(listener: TcpListener, relay: Arc<Relay>, shutdown: F) -> CoreResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "relay listening");
    }
    axum::serve(listener, router(relay))
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("relay stopped");
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn stream_post(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    body: Result<Json<SubmitBody>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(body)) => {
            let req = with_request_id(body.into_request(), &headers);
            relay.submit(req).await
        }
        Err(rejection) => {
            tracing::debug!(error = %rejection.body_text(), "malformed submit body");
            RelayError::Validation(format!("invalid request body: {}", rejection.body_text()))
                .into_response()
        }
    }
}

async fn stream_get(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    query: Result<Query<SubmitQuery>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(q)) => {
            let req = with_request_id(GenerationRequest::from(q), &headers);
            relay.submit(req).await
        }
        Err(rejection) => {
            RelayError::Validation(format!("invalid query: {}", rejection.body_text())).into_response()
        }
    }
}

/// Adopt the caller's `X-Request-Id` when it is present and printable.
fn with_request_id(mut req: GenerationRequest, headers: &HeaderMap) -> GenerationRequest {
    req.request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    req
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn request_id_header_is_adopted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static(" abc-1 "));
        let req = with_request_id(GenerationRequest::new("p", "m"), &headers);
        assert_eq!(req.request_id.as_deref(), Some("abc-1"));

        let req = with_request_id(GenerationRequest::new("p", "m"), &HeaderMap::new());
        assert!(req.request_id.is_none());
    }
}
