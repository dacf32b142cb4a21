//! Bearer-token authentication service.
//!
//! Tokens are issued by the admin surface and stored as salted SHA-256
//! hashes. The hot path never touches the store: [`AuthService`] keeps the
//! full `{hash → record}` map in memory and swaps it copy-on-write on the
//! reload tick, so readers never block. An unknown token id fails closed —
//! there is no "allow all" fallback.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::ProxyError;
use crate::store::{AuthTokenRecord, Store};

/// Salted hash of a client token — the key of the preloaded auth map.
pub fn hash_token(salt: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct AuthService {
    map: RwLock<Arc<HashMap<String, AuthTokenRecord>>>,
}

impl AuthService {
    pub fn new(map: HashMap<String, AuthTokenRecord>) -> Self {
        Self { map: RwLock::new(Arc::new(map)) }
    }

    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }

    /// Swap in a freshly-loaded map. Readers holding the old `Arc` finish
    /// their requests against the old view.
    pub fn replace(&self, map: HashMap<String, AuthTokenRecord>) {
        *self.map.write().expect("auth map lock poisoned") = Arc::new(map);
    }

    /// Reload from the store. Failures keep the previous map.
    pub fn reload_from(&self, store: &Store) {
        match store.load_auth_tokens() {
            Ok(map) => {
                tracing::debug!(count = map.len(), "auth token map reloaded");
                self.replace(map);
            }
            Err(e) => {
                tracing::warn!(error = %e, "auth token reload failed — keeping previous map");
            }
        }
    }

    fn snapshot(&self) -> Arc<HashMap<String, AuthTokenRecord>> {
        self.map.read().expect("auth map lock poisoned").clone()
    }

    /// Validate a presented token. Returns the record on success.
    pub fn verify(
        &self,
        salt: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthTokenRecord, ProxyError> {
        let hash = hash_token(salt, token);
        let map = self.snapshot();
        let record = map
            .get(&hash)
            .ok_or_else(|| ProxyError::AuthFailed("unknown token".into()))?;
        if !record.enabled {
            return Err(ProxyError::AuthFailed("token disabled".into()));
        }
        if let Some(expires) = record.expires_at {
            if expires <= now {
                return Err(ProxyError::AuthFailed("token expired".into()));
            }
        }
        Ok(record.clone())
    }
}

/// Pull the client token out of `Authorization: Bearer …` or `x-api-key`.
pub fn token_from_headers(headers: &axum::http::HeaderMap) -> Option<&str> {
    if let Some(bearer) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(bearer);
    }
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChannelAcl;
    use chrono::Duration;

    fn record(enabled: bool, expires_at: Option<DateTime<Utc>>) -> AuthTokenRecord {
        AuthTokenRecord {
            id: 7,
            name: "cli".into(),
            enabled,
            expires_at,
            acl: ChannelAcl::All,
        }
    }

    fn service_with(token: &str, rec: AuthTokenRecord) -> AuthService {
        let mut map = HashMap::new();
        map.insert(hash_token("salt", token), rec);
        AuthService::new(map)
    }

    // -----------------------------------------------------------------------
    // Hashing
    // -----------------------------------------------------------------------

    #[test]
    fn hash_depends_on_salt_and_token() {
        assert_ne!(hash_token("a", "t"), hash_token("b", "t"));
        assert_ne!(hash_token("a", "t"), hash_token("a", "u"));
        assert_eq!(hash_token("a", "t"), hash_token("a", "t"));
    }

    // -----------------------------------------------------------------------
    // verify
    // -----------------------------------------------------------------------

    #[test]
    fn valid_token_verifies() {
        let svc = service_with("sk-local-1", record(true, None));
        let rec = svc.verify("salt", "sk-local-1", Utc::now()).expect("valid");
        assert_eq!(rec.id, 7);
    }

    #[test]
    fn unknown_token_fails_closed() {
        let svc = service_with("sk-local-1", record(true, None));
        assert!(matches!(
            svc.verify("salt", "sk-other", Utc::now()),
            Err(ProxyError::AuthFailed(_))
        ));
    }

    #[test]
    fn disabled_token_rejected() {
        let svc = service_with("sk-local-1", record(false, None));
        assert!(svc.verify("salt", "sk-local-1", Utc::now()).is_err());
    }

    #[test]
    fn expired_token_rejected() {
        let now = Utc::now();
        let svc = service_with("sk-local-1", record(true, Some(now - Duration::seconds(1))));
        assert!(svc.verify("salt", "sk-local-1", now).is_err());

        let svc = service_with("sk-local-1", record(true, Some(now + Duration::hours(1))));
        assert!(svc.verify("salt", "sk-local-1", now).is_ok());
    }

    #[test]
    fn replace_swaps_map_for_new_reads() {
        let svc = service_with("sk-local-1", record(true, None));
        svc.replace(HashMap::new());
        assert!(svc.verify("salt", "sk-local-1", Utc::now()).is_err());
    }

    // -----------------------------------------------------------------------
    // Header extraction
    // -----------------------------------------------------------------------

    #[test]
    fn bearer_header_preferred_over_x_api_key() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer from-bearer".parse().unwrap());
        headers.insert("x-api-key", "from-api-key".parse().unwrap());
        assert_eq!(token_from_headers(&headers), Some("from-bearer"));
    }

    #[test]
    fn x_api_key_used_when_no_bearer() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-api-key", "from-api-key".parse().unwrap());
        assert_eq!(token_from_headers(&headers), Some("from-api-key"));
    }

    #[test]
    fn missing_headers_yield_none() {
        assert_eq!(token_from_headers(&axum::http::HeaderMap::new()), None);
    }
}
