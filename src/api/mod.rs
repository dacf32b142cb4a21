//! HTTP surface: the proxy routes plus the small infrastructure endpoints.
//!
//! `/health` is public; everything else sits behind the bearer-auth
//! middleware. The wildcard `/v1/{*path}` and `/v1beta/{*path}` routes are
//! the proxy surface itself; the named routes in front of them (models,
//! count_tokens) take precedence by being more specific.

pub mod client_auth;
pub mod count_tokens;
pub mod health;
pub mod models;
pub mod proxy;
pub mod request_id;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{any, get, post},
    Router,
};

use crate::driver::ProxyState;

pub fn router(state: Arc<ProxyState>) -> Router {
    let authed = Router::new()
        .route("/v1/models", get(models::v1_models))
        .route("/v1beta/models", get(models::v1beta_models))
        .route("/v1/messages/count_tokens", post(count_tokens::count_tokens))
        .route("/v1/{*path}", any(proxy::proxy))
        .route("/v1beta/{*path}", any(proxy::proxy))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            client_auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(health::health))
        .merge(authed)
        .layer(middleware::from_fn(request_id::request_id_middleware))
        .with_state(state)
}
