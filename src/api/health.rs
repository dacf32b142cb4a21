//! Liveness probe.
//!
//! `GET /health` pings the store with a 100 ms budget. A slow or broken
//! store reports `degraded` with 503 so orchestrators can route around the
//! instance without killing in-flight streams.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::driver::ProxyState;

const STORE_PING_BUDGET: Duration = Duration::from_millis(100);

pub async fn health(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    let store = state.store.clone();
    let ping = tokio::task::spawn_blocking(move || store.ping());

    let store_ok = matches!(
        tokio::time::timeout(STORE_PING_BUDGET, ping).await,
        Ok(Ok(Ok(())))
    );

    if store_ok {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "degraded", "store": "unreachable" })))
    }
}
