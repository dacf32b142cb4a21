//! Bearer-token authentication middleware for the proxy surface.
//!
//! Tokens arrive as `Authorization: Bearer <token>` or `x-api-key`. The
//! presented value is hashed with the global salt and looked up in the
//! preloaded auth map; the matched record is injected as an [`AuthedToken`]
//! extension so the proxy handler never re-verifies. Unknown, disabled and
//! expired tokens all fail closed with 401.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;

use crate::auth::token_from_headers;
use crate::driver::ProxyState;
use crate::store::AuthTokenRecord;

/// Request extension set by [`auth_middleware`].
#[derive(Clone, Debug)]
pub struct AuthedToken(pub AuthTokenRecord);

pub async fn auth_middleware(
    State(state): State<Arc<ProxyState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = token_from_headers(req.headers()) else {
        return unauthorized("missing bearer token");
    };

    let salt = state.settings.snapshot().token_salt.clone();
    match state.auth.verify(&salt, token, Utc::now()) {
        Ok(record) => {
            req.extensions_mut().insert(AuthedToken(record));
            next.run(req).await
        }
        Err(e) => unauthorized(&e.to_string()),
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer realm=\"ccload\"")],
        Json(json!({ "error": { "type": "authentication_error", "message": message } })),
    )
        .into_response()
}
