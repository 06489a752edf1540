use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::config::OAuthConfig;
use crate::error::{RouteCodexError, Result};

/// A provider-family OAuth manager's observable lifecycle (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthState {
    Loaded,
    Valid,
    ExpiringSoon,
    Refreshing,
    Expired,
    RefreshFailed,
}

/// The on-disk shape of a provider's OAuth credentials (spec §6):
/// `{access_token, refresh_token?, expires_at, scopes, …}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: i64,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl TokenSet {
    fn is_expiring_within(&self, margin: Duration) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        self.expires_at - now <= margin.as_secs() as i64
    }
}

/// Atomic, permission-locked JSON token persistence: temp-file then rename,
/// 0700 directory / 0600 file (grounded in `clawft-plugin-oauth2`'s
/// `TokenStore`, the only generic — not vendor-keyring-backed — OAuth
/// persistence pattern in the retrieved corpus).
struct TokenStore;

impl TokenStore {
    fn ensure_parent_dir(path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| RouteCodexError::ConfigInvalid(format!("cannot create {dir:?}: {e}")))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).ok();
            }
        }
        Ok(())
    }

    fn load(path: &str) -> Result<TokenSet> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RouteCodexError::AuthExpired { provider_id: format!("{path}: {e}") })?;
        serde_json::from_str(&contents).map_err(RouteCodexError::from)
    }

    fn store(path: &str, tokens: &TokenSet) -> Result<()> {
        let path = Path::new(path);
        Self::ensure_parent_dir(path)?;
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(tokens)?;
        std::fs::write(&tmp, body)
            .map_err(|e| RouteCodexError::ConfigInvalid(format!("cannot write {tmp:?}: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).ok();
        }
        std::fs::rename(&tmp, path)
            .map_err(|e| RouteCodexError::ConfigInvalid(format!("cannot rename into {path:?}: {e}")))?;
        Ok(())
    }
}

/// Family-specific refresh-token endpoints. Device-code and authorization
/// flows (first-time login) are out of scope for the proxy runtime — only
/// refresh is needed once a token file exists (spec §4.2 operation b/c).
fn token_endpoint(family: &str) -> Option<&'static str> {
    match family {
        "qwen" => Some("https://chat.qwen.ai/api/v1/oauth2/token"),
        "iflow" => Some("https://iflow.cn/oauth/token"),
        _ => None,
    }
}

/// Per-identity OAuth credential manager (spec §4.2). One instance per
/// `(providerId, keyId)` OAuth alias; refresh is serialized through
/// `refresh_lock` so concurrent readers never trigger more than one
/// in-flight refresh for the same token file (spec §5, §8 scenario 6).
pub struct OAuthManager {
    config: OAuthConfig,
    http: reqwest::Client,
    cached: RwLock<Option<TokenSet>>,
    refresh_lock: Mutex<()>,
    state: RwLock<OAuthState>,
    refresh_margin: Duration,
}

impl OAuthManager {
    pub fn new(config: OAuthConfig) -> Self {
        OAuthManager {
            config,
            http: reqwest::Client::new(),
            cached: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            state: RwLock::new(OAuthState::Loaded),
            refresh_margin: Duration::from_secs(60),
        }
    }

    pub async fn state(&self) -> OAuthState {
        *self.state.read().await
    }

    /// Invalidates the in-memory cache so the next `access_token()` call
    /// re-reads the token file and, if still expired, forces a refresh.
    /// Called by the Provider module after observing a 401 against a
    /// previously "stale-but-usable" token (spec §7).
    pub async fn mark_invalid(&self) {
        *self.cached.write().await = None;
    }

    async fn read_current(&self) -> Result<TokenSet> {
        if let Some(cached) = self.cached.read().await.clone() {
            return Ok(cached);
        }
        let loaded = TokenStore::load(&self.config.token_file)?;
        *self.cached.write().await = Some(loaded.clone());
        Ok(loaded)
    }

    /// Returns a bearer access token, refreshing first if the cached token
    /// is expired or within the safety margin of expiring (spec §4.2).
    pub async fn access_token(&self) -> Result<String> {
        let current = self.read_current().await?;
        if !current.is_expiring_within(self.refresh_margin) {
            *self.state.write().await = OAuthState::Valid;
            return Ok(current.access_token);
        }
        *self.state.write().await = OAuthState::ExpiringSoon;

        let _guard = self.refresh_lock.lock().await;
        // Re-check: another task may have refreshed while we waited for the lock.
        *self.cached.write().await = None;
        let current = self.read_current().await?;
        if !current.is_expiring_within(self.refresh_margin) {
            *self.state.write().await = OAuthState::Valid;
            return Ok(current.access_token);
        }

        *self.state.write().await = OAuthState::Refreshing;
        match self.do_refresh(&current).await {
            Ok(refreshed) => {
                TokenStore::store(&self.config.token_file, &refreshed)?;
                let token = refreshed.access_token.clone();
                *self.cached.write().await = Some(refreshed);
                *self.state.write().await = OAuthState::Valid;
                Ok(token)
            }
            Err(err) => {
                *self.state.write().await = OAuthState::RefreshFailed;
                tracing::warn!(
                    family = %self.config.family,
                    error = %err,
                    "oauth refresh failed, falling back to stale token if usable"
                );
                if !current.access_token.is_empty() {
                    Ok(current.access_token)
                } else {
                    Err(RouteCodexError::AuthExpired { provider_id: self.config.family.clone() })
                }
            }
        }
    }

    async fn do_refresh(&self, current: &TokenSet) -> Result<TokenSet> {
        let refresh_token = current.refresh_token.as_deref().ok_or_else(|| {
            RouteCodexError::AuthExpired { provider_id: self.config.family.clone() }
        })?;
        let url = token_endpoint(&self.config.family).ok_or_else(|| {
            RouteCodexError::ConfigInvalid(format!(
                "no oauth token endpoint known for family '{}'",
                self.config.family
            ))
        })?;

        let mut params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.clone()));
        }

        let response = self.http.post(url).form(&params).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(RouteCodexError::AuthExpired {
                provider_id: format!("{} refresh rejected ({status}): {body}", self.config.family),
            });
        }

        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| RouteCodexError::AuthExpired {
                provider_id: format!("{}: no access_token in refresh response", self.config.family),
            })?
            .to_string();
        let expires_in = body.get("expires_in").and_then(|v| v.as_i64()).unwrap_or(3600);
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
        let new_refresh_token = body
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| current.refresh_token.clone());

        Ok(TokenSet {
            access_token,
            refresh_token: new_refresh_token,
            expires_at: now + expires_in,
            scopes: current.scopes.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_token_file(dir: &Path, expires_at: i64) -> String {
        let path = dir.join("creds.json");
        let tokens = TokenSet {
            access_token: "atok".into(),
            refresh_token: Some("rtok".into()),
            expires_at,
            scopes: vec![],
        };
        std::fs::write(&path, serde_json::to_string(&tokens).unwrap()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_refresh() {
        let dir = tempdir().unwrap();
        let far_future = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64 + 7200;
        let path = write_token_file(dir.path(), far_future);
        let manager = OAuthManager::new(OAuthConfig {
            token_file: path,
            client_id: "client".into(),
            client_secret: None,
            scopes: vec![],
            family: "qwen".into(),
        });
        let token = manager.access_token().await.unwrap();
        assert_eq!(token, "atok");
        assert_eq!(manager.state().await, OAuthState::Valid);
    }

    #[tokio::test]
    async fn expired_token_without_refresh_endpoint_falls_back_to_stale() {
        let dir = tempdir().unwrap();
        let past = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64 - 10;
        let path = write_token_file(dir.path(), past);
        let manager = OAuthManager::new(OAuthConfig {
            token_file: path,
            client_id: "client".into(),
            client_secret: None,
            scopes: vec![],
            family: "unknown-family".into(),
        });
        // the refresh call fails (no known endpoint) but a stale token exists,
        // so the first occurrence still returns a usable bearer token.
        let token = manager.access_token().await.unwrap();
        assert_eq!(token, "atok");
        assert_eq!(manager.state().await, OAuthState::RefreshFailed);
    }

    /// Spec §8 scenario 6: many concurrent callers against one expiring
    /// token must all observe a consistent result and never panic, since
    /// `refresh_lock` serializes the refresh attempt itself.
    #[tokio::test]
    async fn concurrent_callers_share_a_single_refresh_attempt() {
        let dir = tempdir().unwrap();
        let past = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64 - 10;
        let path = write_token_file(dir.path(), past);
        let manager = std::sync::Arc::new(OAuthManager::new(OAuthConfig {
            token_file: path,
            client_id: "client".into(),
            client_secret: None,
            scopes: vec![],
            family: "unknown-family".into(),
        }));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..10 {
            let manager = manager.clone();
            tasks.spawn(async move { manager.access_token().await });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().unwrap(), "atok");
        }
        assert_eq!(manager.state().await, OAuthState::RefreshFailed);
    }
}
