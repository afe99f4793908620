use std::time::{Duration, Instant};

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tokio::sync::Mutex,
    tracing::debug,
};

use crate::{
    config::DingTalkAccountConfig,
    error::{Error, Result},
};

/// Supplies the bearer credential for DingTalk OpenAPI calls.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credential(&self) -> Result<Secret<String>>;
}

#[derive(Clone)]
pub struct CachedAccessToken {
    pub token: Secret<String>,
    pub expires_at: Instant,
}

impl CachedAccessToken {
    fn is_valid(&self) -> bool {
        let refresh_skew = Duration::from_secs(60);
        self.expires_at > Instant::now() + refresh_skew
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    expire_in: Option<u64>,
}

/// App access token fetched with the account's app key and secret, cached
/// until shortly before it expires.
pub struct TokenCache {
    http: reqwest::Client,
    token_url: url::Url,
    app_key: String,
    app_secret: Secret<String>,
    cache: Mutex<Option<CachedAccessToken>>,
}

impl TokenCache {
    pub fn new(http: reqwest::Client, config: &DingTalkAccountConfig) -> Result<Self> {
        let token_url = url::Url::parse(&config.api_base)?.join("/v1.0/oauth2/accessToken")?;
        Ok(Self {
            http,
            token_url,
            app_key: config.client_id.clone(),
            app_secret: config.client_secret.clone(),
            cache: Mutex::new(None),
        })
    }
}

#[async_trait]
impl CredentialProvider for TokenCache {
    async fn get_credential(&self) -> Result<Secret<String>> {
        let mut guard = self.cache.lock().await;
        if let Some(token) = guard.as_ref()
            && token.is_valid()
        {
            return Ok(token.token.clone());
        }

        let body = serde_json::json!({
            "appKey": self.app_key,
            "appSecret": self.app_secret.expose_secret(),
        });
        let resp = self
            .http
            .post(self.token_url.clone())
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                operation: "access token request",
                status,
                body,
            });
        }

        let body: TokenResponse = resp.json().await?;
        let ttl = body.expire_in.unwrap_or(7200).max(120);
        debug!(ttl_secs = ttl, "refreshed DingTalk access token");
        let cached = CachedAccessToken {
            token: Secret::new(body.access_token),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        };
        let token = cached.token.clone();
        *guard = Some(cached);
        Ok(token)
    }
}
