//! Access-token acquisition for the Spotify Web API.
//!
//! Two modes: a user grant backed by a persisted refresh token, and the
//! client-credentials grant with an in-memory cache. Either way callers only
//! see `access_token()`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::TokenResponse;
use super::CatalogError;

/// Tokens are refreshed once they are within this margin of expiry, so a
/// token never expires mid-batch.
const REFRESH_MARGIN_SECS: i64 = 60;
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl StoredToken {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + chrono::Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

/// Persistence for a user's OAuth grant.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<StoredToken>>;
    fn save(&self, token: &StoredToken) -> Result<()>;
}

/// Token store backed by a single JSON file.
pub struct JsonFileTokenStore {
    path: PathBuf,
}

impl JsonFileTokenStore {
    pub fn new(path: PathBuf) -> Self {
        JsonFileTokenStore { path }
    }
}

impl TokenStore for JsonFileTokenStore {
    fn load(&self) -> Result<Option<StoredToken>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read token file {:?}", self.path))?;
        let token = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse token file {:?}", self.path))?;
        Ok(Some(token))
    }

    fn save(&self, token: &StoredToken) -> Result<()> {
        let content = serde_json::to_string_pretty(token)?;
        // Write-then-rename so a crash never leaves a truncated token file.
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write token file {:?}", tmp_path))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace token file {:?}", self.path))?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Grant {
    ClientCredentials,
    RefreshToken(String),
}

/// Exchange of a grant for a token at the accounts endpoint. Behind a trait
/// so token logic is testable without a network.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch_token(&self, grant: &Grant) -> Result<TokenResponse, CatalogError>;
}

pub struct HttpTokenFetcher {
    client: reqwest::Client,
    accounts_base_url: String,
    client_id: String,
    client_secret: String,
}

impl HttpTokenFetcher {
    pub fn new(
        accounts_base_url: String,
        client_id: String,
        client_secret: String,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()?;
        Ok(HttpTokenFetcher {
            client,
            accounts_base_url,
            client_id,
            client_secret,
        })
    }
}

#[async_trait]
impl TokenFetcher for HttpTokenFetcher {
    async fn fetch_token(&self, grant: &Grant) -> Result<TokenResponse, CatalogError> {
        let url = format!("{}/api/token", self.accounts_base_url);
        let mut form = vec![
            ("client_id".to_string(), self.client_id.clone()),
            ("client_secret".to_string(), self.client_secret.clone()),
        ];
        match grant {
            Grant::ClientCredentials => {
                form.push(("grant_type".to_string(), "client_credentials".to_string()));
            }
            Grant::RefreshToken(refresh_token) => {
                form.push(("grant_type".to_string(), "refresh_token".to_string()));
                form.push(("refresh_token".to_string(), refresh_token.clone()));
            }
        }

        let response = self.client.post(&url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::Authentication(format!(
                "Token endpoint returned {}: {}",
                status, body
            )));
        }
        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| CatalogError::Authentication(format!("Invalid token response: {e}")))?;
        Ok(token)
    }
}

enum TokenMode {
    App {
        cached: tokio::sync::Mutex<Option<StoredAppToken>>,
    },
    User {
        store: Arc<dyn TokenStore>,
    },
}

struct StoredAppToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

pub struct TokenProvider {
    fetcher: Arc<dyn TokenFetcher>,
    mode: TokenMode,
}

impl TokenProvider {
    /// Client-credentials mode: token cached in memory, refreshed when
    /// within a minute of expiry.
    pub fn client_credentials(fetcher: Arc<dyn TokenFetcher>) -> Self {
        TokenProvider {
            fetcher,
            mode: TokenMode::App {
                cached: tokio::sync::Mutex::new(None),
            },
        }
    }

    /// User-grant mode: access token read from the store, refreshed via the
    /// persisted refresh token when within a minute of expiry. A rotated
    /// refresh token in the response replaces the stored one.
    pub fn user_grant(fetcher: Arc<dyn TokenFetcher>, store: Arc<dyn TokenStore>) -> Self {
        TokenProvider {
            fetcher,
            mode: TokenMode::User { store },
        }
    }

    pub async fn access_token(&self) -> Result<String, CatalogError> {
        match &self.mode {
            TokenMode::App { cached } => {
                let mut cached = cached.lock().await;
                let now = Utc::now();
                if let Some(token) = cached.as_ref() {
                    if token.expires_at > now + chrono::Duration::seconds(REFRESH_MARGIN_SECS) {
                        return Ok(token.access_token.clone());
                    }
                }
                debug!("Fetching client-credentials token");
                let response = self.fetcher.fetch_token(&Grant::ClientCredentials).await?;
                let expires_in = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
                let token = StoredAppToken {
                    access_token: response.access_token.clone(),
                    expires_at: now + chrono::Duration::seconds(expires_in),
                };
                *cached = Some(token);
                Ok(response.access_token)
            }
            TokenMode::User { store } => {
                let stored = store
                    .load()
                    .map_err(|e| CatalogError::Authentication(e.to_string()))?
                    .ok_or_else(|| {
                        CatalogError::Authentication("No stored user grant".to_string())
                    })?;

                let now = Utc::now();
                if !stored.needs_refresh(now) {
                    return Ok(stored.access_token);
                }

                debug!("Refreshing user access token");
                let response = self
                    .fetcher
                    .fetch_token(&Grant::RefreshToken(stored.refresh_token.clone()))
                    .await?;
                let expires_in = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
                let refreshed = StoredToken {
                    access_token: response.access_token.clone(),
                    refresh_token: response.refresh_token.unwrap_or(stored.refresh_token),
                    expires_at: now + chrono::Duration::seconds(expires_in),
                };
                store
                    .save(&refreshed)
                    .map_err(|e| CatalogError::Authentication(e.to_string()))?;
                Ok(response.access_token)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeFetcher {
        grants: Mutex<Vec<Grant>>,
        response: TokenResponse,
    }

    impl FakeFetcher {
        fn new(response: TokenResponse) -> Self {
            FakeFetcher {
                grants: Mutex::new(Vec::new()),
                response,
            }
        }
    }

    #[async_trait]
    impl TokenFetcher for FakeFetcher {
        async fn fetch_token(&self, grant: &Grant) -> Result<TokenResponse, CatalogError> {
            self.grants.lock().unwrap().push(grant.clone());
            Ok(TokenResponse {
                access_token: self.response.access_token.clone(),
                token_type: self.response.token_type.clone(),
                expires_in: self.response.expires_in,
                refresh_token: self.response.refresh_token.clone(),
            })
        }
    }

    struct MemoryTokenStore {
        token: Mutex<Option<StoredToken>>,
    }

    impl TokenStore for MemoryTokenStore {
        fn load(&self) -> Result<Option<StoredToken>> {
            Ok(self.token.lock().unwrap().clone())
        }

        fn save(&self, token: &StoredToken) -> Result<()> {
            *self.token.lock().unwrap() = Some(token.clone());
            Ok(())
        }
    }

    fn token_response(access: &str, refresh: Option<&str>) -> TokenResponse {
        TokenResponse {
            access_token: access.to_string(),
            token_type: Some("Bearer".to_string()),
            expires_in: Some(3600),
            refresh_token: refresh.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn test_fresh_user_token_is_returned_without_refresh() {
        let fetcher = Arc::new(FakeFetcher::new(token_response("new", None)));
        let store = Arc::new(MemoryTokenStore {
            token: Mutex::new(Some(StoredToken {
                access_token: "current".to_string(),
                refresh_token: "refresh".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })),
        });
        let provider = TokenProvider::user_grant(fetcher.clone(), store);

        assert_eq!(provider.access_token().await.unwrap(), "current");
        assert!(fetcher.grants.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_token_refreshed_within_expiry_margin() {
        let fetcher = Arc::new(FakeFetcher::new(token_response("new", None)));
        let store = Arc::new(MemoryTokenStore {
            token: Mutex::new(Some(StoredToken {
                access_token: "stale".to_string(),
                refresh_token: "refresh".to_string(),
                expires_at: Utc::now() + chrono::Duration::seconds(30),
            })),
        });
        let provider = TokenProvider::user_grant(fetcher.clone(), store.clone());

        assert_eq!(provider.access_token().await.unwrap(), "new");
        assert_eq!(
            *fetcher.grants.lock().unwrap(),
            vec![Grant::RefreshToken("refresh".to_string())]
        );
        // Old refresh token kept when the response does not rotate it.
        let persisted = store.load().unwrap().unwrap();
        assert_eq!(persisted.access_token, "new");
        assert_eq!(persisted.refresh_token, "refresh");
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_is_persisted() {
        let fetcher = Arc::new(FakeFetcher::new(token_response("new", Some("rotated"))));
        let store = Arc::new(MemoryTokenStore {
            token: Mutex::new(Some(StoredToken {
                access_token: "stale".to_string(),
                refresh_token: "old".to_string(),
                expires_at: Utc::now() - chrono::Duration::minutes(5),
            })),
        });
        let provider = TokenProvider::user_grant(fetcher, store.clone());

        provider.access_token().await.unwrap();
        let persisted = store.load().unwrap().unwrap();
        assert_eq!(persisted.refresh_token, "rotated");
    }

    #[tokio::test]
    async fn test_missing_user_grant_is_authentication_error() {
        let fetcher = Arc::new(FakeFetcher::new(token_response("new", None)));
        let store = Arc::new(MemoryTokenStore {
            token: Mutex::new(None),
        });
        let provider = TokenProvider::user_grant(fetcher, store);

        assert!(matches!(
            provider.access_token().await,
            Err(CatalogError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_client_credentials_token_is_cached() {
        let fetcher = Arc::new(FakeFetcher::new(token_response("app-token", None)));
        let provider = TokenProvider::client_credentials(fetcher.clone());

        assert_eq!(provider.access_token().await.unwrap(), "app-token");
        assert_eq!(provider.access_token().await.unwrap(), "app-token");
        assert_eq!(fetcher.grants.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_json_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileTokenStore::new(dir.path().join("token.json"));

        assert!(store.load().unwrap().is_none());

        let token = StoredToken {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };
        store.save(&token).unwrap();
        assert_eq!(store.load().unwrap().unwrap(), token);
    }
}
