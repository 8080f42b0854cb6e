//! Outbound HTTP: wire types, the reqwest transport, and the OAuth
//! client-credentials token source.

pub mod http;
pub mod oauth;

use bytes::Bytes;
use opflow_core::{ContentType, HttpMethod, Provider};

pub use http::{HttpTransportConfig, ReqwestTransport};
pub use oauth::ClientCredentialsTokenSource;

/// A transport-ready request produced by the request builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Query pairs appended to `url`.
    pub query: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    #[must_use]
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// The URL as it may appear in logs and error bodies: query string and
    /// fragment dropped, the provider's access and secret keys masked.
    #[must_use]
    pub fn redacted_url(&self, provider: &Provider) -> String {
        let end = self.url.find(['?', '#']).unwrap_or(self.url.len());
        let mut url = self.url[..end].to_string();
        for secret in [&provider.access_key, &provider.secret_key]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
        {
            url = url.replace(secret.as_str(), "***");
        }
        url
    }

    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A raw response as received from the remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    #[must_use]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// JSON response with a matching content type, mostly for tests.
    #[must_use]
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self::new(status, body.to_string()).with_header("content-type", "application/json")
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Content type declared by the `Content-Type` header, if recognised.
    #[must_use]
    pub fn content_type(&self) -> Option<ContentType> {
        self.header("content-type").and_then(ContentType::from_mime)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacted_url_hides_query_and_provider_keys() {
        let provider = Provider {
            id: opflow_core::ProviderId(1),
            name: "p".to_string(),
            base_url: "https://x.test".to_string(),
            access_key: Some("AK123".to_string()),
            secret_key: Some("s3cr3t".to_string()),
            user_id: None,
            properties: std::collections::BTreeMap::new(),
        };
        let req = HttpRequest::new(HttpMethod::Get, "https://x.test/v1/AK123/items?sig=s3cr3t#top");
        assert_eq!(req.redacted_url(&provider), "https://x.test/v1/***/items");

        let plain = HttpRequest::new(HttpMethod::Get, "https://x.test/items");
        assert_eq!(plain.redacted_url(&provider), "https://x.test/items");
    }

    #[test]
    fn header_lookup_ignores_case() {
        let resp = HttpResponse::new(200, "x").with_header("Content-Type", "text/xml");
        assert_eq!(resp.header("content-type"), Some("text/xml"));
        assert_eq!(resp.content_type(), Some(ContentType::Xml));
        assert!(resp.is_success());
        assert!(!HttpResponse::new(404, "").is_success());
    }
}
