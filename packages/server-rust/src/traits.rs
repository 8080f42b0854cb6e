//! Collaborator interfaces the operation engine depends on.
//!
//! The engine never talks to HTTP clients, document stores, token endpoints
//! or permission systems directly; it goes through these traits. Reference
//! implementations live in [`crate::transport`], [`crate::storage`],
//! [`crate::service::rate_limit`] and [`crate::service::scheduler`].

use async_trait::async_trait;
use opflow_core::{Caller, EffectiveServiceRequest, Provider, ProviderId, SrId, SrRateLimit};

use crate::storage::{Document, InsertOutcome, NaturalKey};
use crate::transport::{HttpRequest, HttpResponse};

/// Sends one HTTP request to a third-party endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dispatch `request`. Non-2xx statuses are responses, not errors.
    async fn send(&self, request: &HttpRequest) -> anyhow::Result<HttpResponse>;
}

/// Stores extracted items keyed by their natural key.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Look up a document by natural key in `collection`.
    async fn find_one(&self, collection: &str, key: &NaturalKey)
        -> anyhow::Result<Option<Document>>;

    /// Insert `document` unless one with the same natural key exists.
    async fn insert(&self, collection: &str, document: Document) -> anyhow::Result<InsertOutcome>;

    /// Number of documents in `collection`.
    async fn count(&self, collection: &str) -> anyhow::Result<usize>;
}

/// Supplies bearer tokens for OAuth providers.
#[async_trait]
pub trait OAuthTokenSource: Send + Sync {
    async fn access_token(&self, provider: &Provider) -> anyhow::Result<String>;
}

/// Decides whether a caller may run a service request.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn authorize(
        &self,
        caller: &Caller,
        provider: &Provider,
        sr: &EffectiveServiceRequest,
    ) -> anyhow::Result<bool>;
}

/// Permits every caller. Used when access control lives elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AccessPolicy for AllowAll {
    async fn authorize(
        &self,
        _caller: &Caller,
        _provider: &Provider,
        _sr: &EffectiveServiceRequest,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Hook fired immediately before a request is handed to the transport.
pub trait RequestObserver: Send + Sync {
    fn before_send(&self, sr_id: SrId, request: &HttpRequest);
}

/// Logs the method and URL of every outbound request. Headers and bodies are
/// never logged since they carry credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl RequestObserver for TracingObserver {
    fn before_send(&self, sr_id: SrId, request: &HttpRequest) {
        tracing::debug!(
            sr_id = %sr_id,
            method = %request.method,
            url = %request.url,
            query_params = request.query.len(),
            "dispatching request"
        );
    }
}

/// Outbound call budget. `acquire` waits until a call is allowed; it never
/// drops the call.
#[async_trait]
pub trait RateGate: Send + Sync {
    async fn acquire(&self, provider_id: ProviderId, limit: Option<SrRateLimit>);
}

/// A gate that never waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait]
impl RateGate for Unlimited {
    async fn acquire(&self, _provider_id: ProviderId, _limit: Option<SrRateLimit>) {}
}

/// Polled at every page and chained dispatch of long-running invocations.
#[async_trait]
pub trait CancellationProbe: Send + Sync {
    /// `true` when work for `sr_id` should stop (schedule disabled, tenant
    /// removed).
    async fn is_cancelled(&self, sr_id: SrId) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancelled;

#[async_trait]
impl CancellationProbe for NeverCancelled {
    async fn is_cancelled(&self, _sr_id: SrId) -> bool {
        false
    }
}
