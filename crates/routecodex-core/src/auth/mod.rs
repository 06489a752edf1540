mod oauth;

use async_trait::async_trait;

use crate::config::{KeyMappings, OAuthConfig};
use crate::error::{RouteCodexError, Result};

pub use oauth::{OAuthManager, OAuthState, TokenSet};

/// The auth block a pipeline carries after assembly (spec §4.2). Providers
/// that use a plain bearer key resolve once, at assembly time; OAuth
/// providers carry the descriptor and resolve a fresh bearer token on every
/// request through their `OAuthManager`.
#[derive(Debug, Clone)]
pub enum ResolvedAuth {
    ApiKey { api_key: String },
    OAuth { oauth: OAuthConfig },
}

/// `resolveAuth(providerId, keyId, mappings) -> auth` (spec §4.2). OAuth
/// aliases take priority only because they're checked first when both maps
/// happen to share an alias name, which the config normalizer should never
/// produce but nothing in the data model forbids.
pub fn resolve_auth(provider_id: &str, key_id: &str, mappings: &KeyMappings) -> Result<ResolvedAuth> {
    if let Some(oauth) = mappings.resolve_oauth(provider_id, key_id) {
        return Ok(ResolvedAuth::OAuth { oauth: oauth.clone() });
    }
    if let Some(api_key) = mappings.resolve_api_key(provider_id, key_id) {
        return Ok(ResolvedAuth::ApiKey { api_key: api_key.to_string() });
    }
    Err(RouteCodexError::AuthUnresolved {
        provider_id: provider_id.to_string(),
        key_id: key_id.to_string(),
    })
}

/// Resolves a bearer credential for one outbound call. Implemented by both
/// a static-key pass-through and the OAuth manager, so the Provider module
/// doesn't need to know which kind of auth a pipeline carries.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn bearer_token(&self) -> Result<String>;

    /// Called by Provider after an upstream 401/403 so a stale-but-cached
    /// credential isn't handed out again on the next request (spec §7: OAuth
    /// refresh failures only propagate "after any request using that token
    /// sees a 401"). A no-op for credentials that can't go stale.
    async fn invalidate(&self) {}
}

/// Wraps a fixed API key: `resolve()` is infallible and never touches the
/// filesystem or network (grounded in `querymt`'s `StaticKeyResolver`).
pub struct StaticKeyResolver {
    key: String,
}

impl StaticKeyResolver {
    pub fn new(key: impl Into<String>) -> Self {
        StaticKeyResolver { key: key.into() }
    }
}

#[async_trait]
impl CredentialResolver for StaticKeyResolver {
    async fn bearer_token(&self) -> Result<String> {
        Ok(self.key.clone())
    }
}

#[async_trait]
impl CredentialResolver for OAuthManager {
    async fn bearer_token(&self) -> Result<String> {
        self.access_token().await
    }

    async fn invalidate(&self) {
        self.mark_invalid().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn resolves_api_key_alias_before_failing() {
        let mut mappings = KeyMappings::default();
        mappings
            .per_provider
            .entry("glm".to_string())
            .or_insert_with(BTreeMap::new)
            .insert("key1".to_string(), "sk-test".to_string());

        let resolved = resolve_auth("glm", "key1", &mappings).unwrap();
        match resolved {
            ResolvedAuth::ApiKey { api_key } => assert_eq!(api_key, "sk-test"),
            _ => panic!("expected ApiKey"),
        }
    }

    #[test]
    fn unresolved_alias_is_an_error() {
        let mappings = KeyMappings::default();
        let err = resolve_auth("glm", "key1", &mappings).unwrap_err();
        assert!(matches!(err, RouteCodexError::AuthUnresolved { .. }));
    }
}
