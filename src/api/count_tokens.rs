//! `POST /v1/messages/count_tokens` — three-tier token estimator.
//!
//! 1. `?beta=true`: forward to a live Anthropic channel through the regular
//!    retry driver and relay the authoritative answer when one succeeds;
//! 2. local BPE count via `tiktoken-rs`;
//! 3. character-ratio fallback (inside [`crate::tokenizer`], used when the
//!    BPE ranks are unavailable).

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::client_auth::AuthedToken;
use crate::driver::{dispatch, ProxyRequest, ProxyState};
use crate::tokenizer;

#[derive(Debug, Deserialize)]
pub struct CountTokensQuery {
    #[serde(default)]
    beta: bool,
}

pub async fn count_tokens(
    State(state): State<Arc<ProxyState>>,
    Extension(AuthedToken(token)): Extension<AuthedToken>,
    Query(query): Query<CountTokensQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let model = body["model"].as_str().unwrap_or_default().to_string();

    if query.beta && !model.is_empty() {
        let request = ProxyRequest {
            method: Method::POST,
            path: "/v1/messages/count_tokens".into(),
            query: None,
            headers,
            body: body.clone(),
            model: model.clone(),
            channel_type: Some(crate::store::ChannelType::Anthropic),
            streaming: false,
            token,
            client_ip: None,
        };
        let response = dispatch(state, request).await;
        if response.status() == StatusCode::OK {
            return response;
        }
        tracing::debug!(
            status = response.status().as_u16(),
            "live count_tokens failed — falling back to local estimate"
        );
    }

    let input_tokens = tokenizer::count_request_tokens(&body);
    Json(json!({ "input_tokens": input_tokens })).into_response()
}
