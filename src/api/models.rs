//! Model listing endpoints.
//!
//! Each listing aggregates the unique model names across enabled channels of
//! the relevant dialect, filtered by the caller's channel ACL, and renders
//! them in the respective vendor's wire format. Wildcard entries (`*`) are
//! capability markers, not real models, and are skipped.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Extension, Json};
use serde_json::json;

use super::client_auth::AuthedToken;
use crate::driver::ProxyState;
use crate::error::AppError;
use crate::store::{ChannelAcl, ChannelType};

fn collect_models(
    state: &ProxyState,
    acl: &ChannelAcl,
    types: &[ChannelType],
) -> anyhow::Result<BTreeSet<String>> {
    let mut models = BTreeSet::new();
    for channel_type in types {
        for channel in state.cache.enabled_channels_by_type(*channel_type)?.iter() {
            if !acl.allows(channel.id) {
                continue;
            }
            for model in &channel.models {
                if model != "*" {
                    models.insert(model.clone());
                }
            }
        }
    }
    Ok(models)
}

/// `GET /v1/models` — Anthropic-shaped listing over the `/v1` dialects.
pub async fn v1_models(
    State(state): State<Arc<ProxyState>>,
    Extension(AuthedToken(token)): Extension<AuthedToken>,
) -> Result<impl IntoResponse, AppError> {
    let models = collect_models(&state, &token.acl, &[ChannelType::Anthropic, ChannelType::Codex])?;
    let data: Vec<_> = models
        .into_iter()
        .map(|id| {
            json!({
                "type": "model",
                "id": id,
                "display_name": id,
            })
        })
        .collect();
    Ok(Json(json!({ "data": data, "has_more": false })))
}

/// `GET /v1beta/models` — Gemini-shaped listing.
pub async fn v1beta_models(
    State(state): State<Arc<ProxyState>>,
    Extension(AuthedToken(token)): Extension<AuthedToken>,
) -> Result<impl IntoResponse, AppError> {
    let models = collect_models(&state, &token.acl, &[ChannelType::Gemini])?;
    let data: Vec<_> = models
        .into_iter()
        .map(|id| {
            json!({
                "name": format!("models/{id}"),
                "displayName": id,
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
            })
        })
        .collect();
    Ok(Json(json!({ "models": data })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewChannel, Store};

    fn state_with_channels() -> (Arc<ProxyState>, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut config: crate::config::Config = toml::from_str("").unwrap();
        config.server.cache_ttl_secs = 0;
        let (logs, _workers) = crate::logs::start(store.clone(), &config.logs);
        (
            Arc::new(ProxyState::build(config, store.clone(), logs, 10).unwrap()),
            store,
        )
    }

    #[tokio::test]
    async fn collect_models_dedupes_across_channels() {
        let (state, store) = state_with_channels();
        store
            .insert_channel(&NewChannel::basic(
                "a",
                ChannelType::Anthropic,
                "https://a",
                &["claude-sonnet-4-5", "claude-opus-4-1"],
            ))
            .unwrap();
        store
            .insert_channel(&NewChannel::basic(
                "b",
                ChannelType::Anthropic,
                "https://b",
                &["claude-sonnet-4-5", "*"],
            ))
            .unwrap();

        let models =
            collect_models(&state, &ChannelAcl::All, &[ChannelType::Anthropic]).unwrap();
        assert_eq!(
            models.into_iter().collect::<Vec<_>>(),
            vec!["claude-opus-4-1", "claude-sonnet-4-5"]
        );
    }

    #[tokio::test]
    async fn collect_models_respects_acl() {
        let (state, store) = state_with_channels();
        let allowed = store
            .insert_channel(&NewChannel::basic("a", ChannelType::Anthropic, "https://a", &["m1"]))
            .unwrap();
        store
            .insert_channel(&NewChannel::basic("b", ChannelType::Anthropic, "https://b", &["m2"]))
            .unwrap();

        let acl = ChannelAcl::Channels([allowed].into_iter().collect());
        let models = collect_models(&state, &acl, &[ChannelType::Anthropic]).unwrap();
        assert_eq!(models.into_iter().collect::<Vec<_>>(), vec!["m1"]);
    }

    #[tokio::test]
    async fn gemini_listing_excludes_other_dialects() {
        let (state, store) = state_with_channels();
        store
            .insert_channel(&NewChannel::basic("a", ChannelType::Anthropic, "https://a", &["m1"]))
            .unwrap();
        store
            .insert_channel(&NewChannel::basic(
                "g",
                ChannelType::Gemini,
                "https://g",
                &["gemini-2.5-pro"],
            ))
            .unwrap();

        let models = collect_models(&state, &ChannelAcl::All, &[ChannelType::Gemini]).unwrap();
        assert_eq!(models.into_iter().collect::<Vec<_>>(), vec!["gemini-2.5-pro"]);
    }
}
