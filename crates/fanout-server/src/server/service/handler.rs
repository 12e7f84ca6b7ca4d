//! HTTP routes of the batching service.
//!
//! ## Responsibilities
//!
//! - Validate incoming `POST /generate` requests and submit them to the
//!   [`BatchService`].
//! - Stream each caller's own output back as Server-Sent Events.
//! - Map service errors to HTTP status codes.
//! - Report liveness on `GET /health`.

use crate::server::{
    service::{
        models::GenerateRequest,
        stream::sse_events,
    },
    telemetry::{increment_requests, increment_stream_errors, record_prompt_chars},
};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{KeepAlive, Sse},
    },
    routing::{get, post},
};
use fanout::{BatchService, Error};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub service: BatchService,
}

/// Builds the router with permissive CORS, as browser clients read the SSE
/// stream directly.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/health", get(health))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Error returned before a stream is opened.
pub enum ApiError {
    Rejected(JsonRejection),
    Service(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Service(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::Rejected(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        increment_stream_errors();
        let (status, message) = match self {
            Self::Rejected(e) => (StatusCode::BAD_REQUEST, e.body_text()),
            Self::Service(e @ Error::InvalidRequest { .. }) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            Self::Service(e @ Error::ServiceShutdown) => {
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            Self::Service(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Accepts a prompt and answers with a `text/event-stream` of
/// [`GenerateResponse`](super::models::GenerateResponse) events: `in_progress` deltas, then one `completed` or
/// `failed` event.
///
/// If `metrics` is enabled, emits telemetry for:
/// - request rate
/// - prompt length
/// - concurrent stream count
/// - stream duration
/// - delivered fragments
/// - stream errors
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;

    increment_requests();
    record_prompt_chars(request.prompt.chars().count() as f64);

    let handle = state.service.submit(request.prompt).await?;

    #[cfg(feature = "tracing")]
    tracing::debug!(
        "Request {} joined job {}",
        handle.request_id,
        handle.job_id
    );

    Ok(Sse::new(sse_events(handle.stream))
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::service::models::{GenerateResponse, ResponseStatus};
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use core::time::Duration;
    use fanout::{MemoryQueue, MockTextGenerator, ServiceConfig};
    use std::sync::Arc;
    use tower::ServiceExt;

    /// Parses the `data:` lines of an SSE body.
    fn parse_events(body: &str) -> Vec<GenerateResponse> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| serde_json::from_str(data).unwrap())
            .collect()
    }

    fn state() -> AppState {
        let config = ServiceConfig {
            batch_window: Duration::from_millis(10),
            max_requests_per_job: 2,
            ..ServiceConfig::default()
        };
        let service = BatchService::new(
            config,
            Arc::new(MemoryQueue::new(16)),
            Arc::new(MockTextGenerator::instant()),
        )
        .unwrap();
        AppState { service }
    }

    fn generate_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/generate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = router(state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn generate_streams_deltas_then_completes() {
        let response = router(state())
            .oneshot(generate_request(r#"{"prompt": "tell me a story"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let events = parse_events(core::str::from_utf8(&body).unwrap());

        let (last, deltas) = events.split_last().unwrap();
        assert_eq!(last.status, ResponseStatus::Completed);
        assert!(!deltas.is_empty());
        assert!(deltas.iter().all(|e| e.status == ResponseStatus::InProgress));
        assert!(events.iter().all(|e| e.request_id == last.request_id));

        let text: String = deltas.iter().map(|e| e.text.as_str()).collect();
        // At least five words plus a closing sentence.
        assert!(text.split_whitespace().count() >= 5);
    }

    #[tokio::test]
    async fn empty_prompt_is_a_bad_request() {
        let response = router(state())
            .oneshot(generate_request(r#"{"prompt": "   "}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value["error"].as_str().unwrap().contains("Prompt cannot be empty"));
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let response = router(state())
            .oneshot(generate_request(r#"{"text": "wrong field"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submissions_during_shutdown_are_refused() {
        let state = state();
        state.service.shutdown().await;

        let response = router(state)
            .oneshot(generate_request(r#"{"prompt": "hello"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
