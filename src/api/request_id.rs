//! Request ID middleware.
//!
//! Ties together server logs, the accounting rows, and the client response
//! through a single identifier: a caller-provided `X-Request-ID` is honored,
//! anything else gets a fresh `req_…` id. The id rides on a tracing span for
//! the rest of the request and is echoed back in the response headers.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument as _;
use uuid::Uuid;

/// Extension carrying the assigned request id.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

fn fresh_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(String::from)
        .unwrap_or_else(fresh_id);

    req.extensions_mut().insert(RequestId(id.clone()));

    let span = tracing::debug_span!("request", id = %id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware, routing::get, Extension, Router};
    use tower::ServiceExt;

    async fn echo_id(Extension(RequestId(id)): Extension<RequestId>) -> String {
        id
    }

    fn app() -> Router {
        Router::new()
            .route("/", get(echo_id))
            .layer(middleware::from_fn(request_id_middleware))
    }

    #[tokio::test]
    async fn caller_provided_id_is_kept_and_echoed() {
        let resp = app()
            .oneshot(
                axum::http::Request::get("/")
                    .header("x-request-id", "trace-me-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers().get("x-request-id").unwrap(), "trace-me-123");
        let body = axum::body::to_bytes(resp.into_body(), 256).await.unwrap();
        assert_eq!(&body[..], b"trace-me-123");
    }

    #[tokio::test]
    async fn missing_id_gets_generated_one() {
        let resp = app()
            .oneshot(axum::http::Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let echoed = resp.headers().get("x-request-id").unwrap().to_str().unwrap();
        assert!(echoed.starts_with("req_"));
    }

    #[tokio::test]
    async fn oversized_id_is_replaced() {
        let resp = app()
            .oneshot(
                axum::http::Request::get("/")
                    .header("x-request-id", "x".repeat(4096))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let echoed = resp.headers().get("x-request-id").unwrap().to_str().unwrap();
        assert!(echoed.starts_with("req_"));
    }
}
