//! `reqwest`-backed [`Transport`].

use std::time::Duration;

use async_trait::async_trait;
use opflow_core::HttpMethod;

use super::{HttpRequest, HttpResponse};
use crate::traits::Transport;

/// Client settings for outbound provider calls.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Whole-request timeout in milliseconds.
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            user_agent: concat!("opflow/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Sends requests with a shared connection pool. No retries.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(config: &HttpTransportConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    #[must_use]
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> anyhow::Result<HttpResponse> {
        let mut builder = self
            .client
            .request(method(request.method), &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(reqwest::Error::without_url)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(reqwest::Error::without_url)?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
