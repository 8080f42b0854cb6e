//! OAuth 2.0 client-credentials token source.
//!
//! Tokens are requested from the provider's `oauth_token_url` property with
//! the provider's access key as `client_id` and secret key as
//! `client_secret`, then cached per provider until shortly before expiry.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _};
use async_trait::async_trait;
use opflow_core::model::property_names;
use opflow_core::{ClockSource, Provider, ProviderId, SystemClock};
use quick_cache::sync::Cache;
use serde::Deserialize;
use tracing::debug;

use crate::traits::OAuthTokenSource;

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN_SECS: u64 = 30;
/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3_600;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    /// Unix seconds after which the token is refreshed.
    refresh_at: u64,
}

/// Fetches and caches client-credentials tokens.
pub struct ClientCredentialsTokenSource {
    client: reqwest::Client,
    clock: Arc<dyn ClockSource>,
    cache: Cache<ProviderId, CachedToken>,
}

impl ClientCredentialsTokenSource {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_clock(client, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(client: reqwest::Client, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            client,
            clock,
            cache: Cache::new(1_024),
        }
    }

    /// Drops the cached token for `provider_id`, e.g. after a 401.
    pub fn invalidate(&self, provider_id: ProviderId) {
        self.cache.remove(&provider_id);
    }

    async fn fetch(&self, provider: &Provider) -> anyhow::Result<CachedToken> {
        let token_url = provider
            .property(property_names::OAUTH_TOKEN_URL)
            .ok_or_else(|| anyhow!("provider {} has no oauth_token_url", provider.id))?;
        let client_id = provider
            .access_key
            .as_deref()
            .ok_or_else(|| anyhow!("provider {} has no access key", provider.id))?;
        let client_secret = provider
            .secret_key
            .as_deref()
            .ok_or_else(|| anyhow!("provider {} has no secret key", provider.id))?;

        let mut params = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];
        if let Some(scope) = provider.property(property_names::OAUTH_SCOPE) {
            params.push(("scope", scope));
        }

        let response = self
            .client
            .post(token_url)
            .form(&params)
            .send()
            .await
            .with_context(|| format!("token request to {token_url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("token endpoint {token_url} returned status {status}");
        }
        let token: TokenResponse = response
            .json()
            .await
            .context("failed to parse token response")?;

        let lifetime = token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let refresh_at = self.clock.now_secs() + lifetime.saturating_sub(EXPIRY_MARGIN_SECS);
        debug!(provider_id = %provider.id, expires_in = lifetime, "acquired access token");
        Ok(CachedToken {
            access_token: token.access_token,
            refresh_at,
        })
    }
}

#[async_trait]
impl OAuthTokenSource for ClientCredentialsTokenSource {
    async fn access_token(&self, provider: &Provider) -> anyhow::Result<String> {
        if let Some(cached) = self.cache.get(&provider.id) {
            if self.clock.now_secs() < cached.refresh_at {
                return Ok(cached.access_token);
            }
        }
        let fresh = self.fetch(provider).await?;
        let token = fresh.access_token.clone();
        self.cache.insert(provider.id, fresh);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn provider(properties: &[(&str, &str)]) -> Provider {
        Provider {
            id: ProviderId(1),
            name: "p".to_string(),
            base_url: "https://p.test".to_string(),
            access_key: Some("id".to_string()),
            secret_key: Some("secret".to_string()),
            user_id: None,
            properties: properties
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[tokio::test]
    async fn missing_token_url_is_an_error() {
        let source = ClientCredentialsTokenSource::new(reqwest::Client::new());
        let err = source.access_token(&provider(&[])).await.unwrap_err();
        assert!(err.to_string().contains("oauth_token_url"));
    }

    #[tokio::test]
    async fn fresh_cached_token_is_reused() {
        let clock = Arc::new(opflow_core::FixedClock::new(1_000_000));
        let source = ClientCredentialsTokenSource::with_clock(reqwest::Client::new(), clock.clone());
        source.cache.insert(
            ProviderId(1),
            CachedToken {
                access_token: "cached".to_string(),
                refresh_at: 1_100,
            },
        );
        // No token URL: any refresh attempt would fail.
        let p = provider(&[]);
        assert_eq!(source.access_token(&p).await.unwrap(), "cached");

        clock.set(1_100_000);
        assert!(source.access_token(&p).await.is_err());
    }

    #[tokio::test]
    async fn token_is_fetched_once_and_refreshed_near_expiry() {
        use std::sync::atomic::{AtomicU32, Ordering};

        use axum::extract::State;
        use axum::routing::post;
        use axum::{Form, Json, Router};
        use serde_json::{json, Value};

        async fn token(
            State(calls): State<Arc<AtomicU32>>,
            Form(form): Form<BTreeMap<String, String>>,
        ) -> Json<Value> {
            assert_eq!(form["grant_type"], "client_credentials");
            assert_eq!(form["client_id"], "id");
            assert_eq!(form["client_secret"], "secret");
            assert_eq!(form["scope"], "read");
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Json(json!({ "access_token": format!("tok-{n}"), "expires_in": 60 }))
        }

        let calls = Arc::new(AtomicU32::new(0));
        let router = Router::new()
            .route("/token", post(token))
            .with_state(calls.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let clock = Arc::new(opflow_core::FixedClock::new(0));
        let source = ClientCredentialsTokenSource::with_clock(reqwest::Client::new(), clock.clone());
        let url = format!("http://{addr}/token");
        let p = provider(&[("oauth_token_url", url.as_str()), ("oauth_scope", "read")]);

        assert_eq!(source.access_token(&p).await.unwrap(), "tok-1");
        assert_eq!(source.access_token(&p).await.unwrap(), "tok-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // 60s lifetime minus the 30s margin.
        clock.advance(31_000);
        assert_eq!(source.access_token(&p).await.unwrap(), "tok-2");

        source.invalidate(ProviderId(1));
        assert_eq!(source.access_token(&p).await.unwrap(), "tok-3");
    }
}
