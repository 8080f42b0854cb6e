//! Operation orchestrator: runs one service request end to end.
//!
//! A run is a worklist of jobs. The root job is the requested Sr; every
//! chain dispatch appends a job for the target Sr. Each job walks its pages
//! sequentially: build the request, send it, extract items, persist them and
//! collect chain dispatches, then ask the pagination driver for the next
//! cursor.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use opflow_core::{
    Action, ClockSource, ConfigSource, ContentType, EffectiveServiceRequest, Provider,
    QueryContext, Service, SrId, SystemClock,
};
use tower::Service as TowerService;
use tracing::{debug, info, warn};

use crate::service::chain::{ChainDispatch, ChainDispatcher};
use crate::service::config::EngineConfig;
use crate::service::operation::{
    Operation, OperationContext, OperationError, RunReport, RunStatus, TriggerOrigin,
};
use crate::service::pagination::{PageDecision, PaginationDriver, PaginationState, StopReason};
use crate::service::persistence::{PersistTarget, PersistenceSink};
use crate::service::request::RequestBuilder;
use crate::service::response::{
    ExtractedItem, OperationResponse, ResponseExtractor, ResponseStatus,
};
use crate::storage::InsertOutcome;
use crate::traits::{
    AccessPolicy, AllowAll, CancellationProbe, DocumentStore, NeverCancelled, OAuthTokenSource,
    RateGate, RequestObserver, TracingObserver, Transport, Unlimited,
};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Everything the engine talks to. Only the catalog, transport, document
/// store and token source are required; the rest default to permissive
/// implementations.
#[derive(Clone)]
pub struct EngineDeps {
    pub config_source: Arc<dyn ConfigSource>,
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn DocumentStore>,
    pub oauth: Arc<dyn OAuthTokenSource>,
    pub access: Arc<dyn AccessPolicy>,
    pub observer: Arc<dyn RequestObserver>,
    pub rate_gate: Arc<dyn RateGate>,
    pub probe: Arc<dyn CancellationProbe>,
    pub clock: Arc<dyn ClockSource>,
}

impl EngineDeps {
    #[must_use]
    pub fn new(
        config_source: Arc<dyn ConfigSource>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn DocumentStore>,
        oauth: Arc<dyn OAuthTokenSource>,
    ) -> Self {
        Self {
            config_source,
            transport,
            store,
            oauth,
            access: Arc::new(AllowAll),
            observer: Arc::new(TracingObserver),
            rate_gate: Arc::new(Unlimited),
            probe: Arc::new(NeverCancelled),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_access_policy(mut self, access: Arc<dyn AccessPolicy>) -> Self {
        self.access = access;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn with_rate_gate(mut self, rate_gate: Arc<dyn RateGate>) -> Self {
        self.rate_gate = rate_gate;
        self
    }

    #[must_use]
    pub fn with_cancellation_probe(mut self, probe: Arc<dyn CancellationProbe>) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }
}

// ---------------------------------------------------------------------------
// OperationEngine
// ---------------------------------------------------------------------------

struct EngineInner {
    deps: EngineDeps,
    config: EngineConfig,
    sink: PersistenceSink,
    chain: ChainDispatcher,
    pages: PaginationDriver,
}

/// Runs service requests. Cheap to clone; clones share collaborators.
#[derive(Clone)]
pub struct OperationEngine {
    inner: Arc<EngineInner>,
}

/// One Sr invocation inside a run.
#[derive(Debug)]
struct Job {
    sr_id: SrId,
    action: Action,
    query: QueryContext,
    /// Srs that led to this job, root first. Empty for the root job.
    path: Vec<SrId>,
}

impl Job {
    fn is_root(&self) -> bool {
        self.path.is_empty()
    }
}

/// Records loaded once per job.
struct Resolved {
    sr: EffectiveServiceRequest,
    provider: Provider,
    service: Service,
}

impl OperationEngine {
    #[must_use]
    pub fn new(deps: EngineDeps, config: EngineConfig) -> Self {
        let sink = PersistenceSink::new(deps.store.clone(), deps.clock.clone());
        let chain = ChainDispatcher::new(config.skip_missing_forwarded_fields);
        let pages = PaginationDriver::new(config.max_pages);
        Self {
            inner: Arc::new(EngineInner {
                deps,
                config,
                sink,
                chain,
                pages,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn config_source(&self) -> &Arc<dyn ConfigSource> {
        &self.inner.deps.config_source
    }

    /// Runs `sr_id` with `query` as its invocation context, following
    /// pagination and chain links until the worklist drains.
    ///
    /// Failures of the root Sr before its first page completes are returned
    /// as errors. Later failures, and any failure of a chained Sr, are
    /// recorded in the report and the run continues with the next job.
    ///
    /// # Errors
    ///
    /// Returns the root Sr's error when it cannot be resolved, authorized,
    /// requested or decoded, or [`OperationError::Cancelled`] when the run
    /// is cancelled before any request was made.
    pub async fn run_operation_for_sr(
        &self,
        ctx: &OperationContext,
        sr_id: SrId,
        action: Action,
        query: QueryContext,
    ) -> Result<RunReport, OperationError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut report = RunReport::new(run_id.clone(), sr_id);
        let mut worklist = VecDeque::from([Job {
            sr_id,
            action,
            query,
            path: Vec::new(),
        }]);

        info!(
            run_id = %run_id,
            sr_id = %sr_id,
            origin = ctx.origin.as_str(),
            action = %action,
            "run started"
        );

        while let Some(job) = worklist.pop_front() {
            if self.is_cancelled(ctx, sr_id).await {
                if report.requests == 0 {
                    return Err(OperationError::Cancelled);
                }
                warn!(run_id = %run_id, sr_id = %job.sr_id, "run cancelled");
                report.truncated = true;
                report.record_issue(job.sr_id, &OperationError::Cancelled);
                break;
            }

            if let Err(err) = self.run_job(ctx, sr_id, &job, &mut report, &mut worklist).await {
                if job.is_root() {
                    metrics::counter!("opflow_runs_failed_total", "kind" => err.kind())
                        .increment(1);
                    return Err(err);
                }
                warn!(
                    run_id = %run_id,
                    sr_id = %job.sr_id,
                    error = %err,
                    "chained service request failed"
                );
                report.record_issue(job.sr_id, &err);
            }
        }

        info!(
            run_id = %run_id,
            sr_id = %sr_id,
            requests = report.requests,
            extracted = report.items_extracted,
            inserted = report.items_inserted,
            duplicates = report.items_duplicate,
            chained = report.chained_dispatches,
            issues = report.issues.len(),
            truncated = report.truncated,
            "run finished"
        );
        Ok(report)
    }

    async fn is_cancelled(&self, ctx: &OperationContext, root: SrId) -> bool {
        if ctx.cancel.is_cancelled() {
            return true;
        }
        matches!(ctx.origin, TriggerOrigin::Schedule | TriggerOrigin::Queued)
            && self.inner.deps.probe.is_cancelled(root).await
    }

    async fn resolve(&self, sr_id: SrId) -> Result<Resolved, OperationError> {
        let source = &self.inner.deps.config_source;
        let sr = source
            .effective_service_request(sr_id)
            .await?
            .ok_or(OperationError::NotFound {
                kind: "service request",
                id: sr_id.0,
            })?;
        let provider = source
            .provider(sr.provider_id)
            .await?
            .ok_or(OperationError::NotFound {
                kind: "provider",
                id: sr.provider_id.0,
            })?;
        let service = source
            .service(sr.service_id)
            .await?
            .ok_or(OperationError::NotFound {
                kind: "service",
                id: sr.service_id.0,
            })?;
        Ok(Resolved {
            sr,
            provider,
            service,
        })
    }

    /// Runs every page of one job. Errors before the first page completes
    /// are returned; later page failures end pagination and are recorded.
    async fn run_job(
        &self,
        ctx: &OperationContext,
        root: SrId,
        job: &Job,
        report: &mut RunReport,
        worklist: &mut VecDeque<Job>,
    ) -> Result<(), OperationError> {
        let resolved = self.resolve(job.sr_id).await?;
        let Resolved {
            sr,
            provider,
            service,
        } = &resolved;

        let allowed = self
            .inner
            .deps
            .access
            .authorize(&ctx.caller, provider, sr)
            .await?;
        if !allowed {
            return Err(OperationError::Unauthorized {
                caller: ctx.caller.id.clone(),
                sr_id: sr.id,
            });
        }

        let page_size = sr
            .default_page_size()
            .unwrap_or(self.inner.config.default_page_size);
        let mut state = PaginationState::seed(sr.pagination_type, &job.query, page_size);

        loop {
            let first_page = state.pages_fetched == 0;
            if !first_page && self.is_cancelled(ctx, root).await {
                report.truncated = true;
                report.record_issue(sr.id, &OperationError::Cancelled);
                return Ok(());
            }

            let mut query = job.query.clone();
            state.apply_to(&mut query);

            let response = match self.fetch_page(provider, sr, &query, report).await {
                Ok(response) => response,
                Err(err) if first_page => return Err(err),
                Err(err) => {
                    warn!(sr_id = %sr.id, page = state.pages_fetched + 1, error = %err, "page failed");
                    report.record_issue(sr.id, &err);
                    return Ok(());
                }
            };

            if response.request_data.is_empty() {
                if first_page && job.is_root() {
                    report.status = RunStatus::NothingToDo;
                }
                debug!(sr_id = %sr.id, page = state.pages_fetched + 1, "no items extracted");
                return Ok(());
            }

            let content_type = response.content_type.unwrap_or(ContentType::Json);
            let target = PersistTarget {
                provider,
                service,
                sr,
                content_type,
            };
            let extra = response.extra_data;
            for item in response.request_data.into_items() {
                report.items_extracted += 1;
                match job.action {
                    Action::Return => {
                        if job.is_root() {
                            report.items.push(item.fields);
                        }
                    }
                    Action::Store => {
                        self.store_item(&target, &item, &query, report).await;
                        match self.inner.chain.dispatches(sr, &item) {
                            Ok(dispatches) => {
                                for dispatch in dispatches {
                                    self.enqueue(job, dispatch, report, worklist);
                                }
                            }
                            Err(err) => {
                                warn!(sr_id = %sr.id, error = %err, "chain dispatch skipped");
                                report.record_issue(sr.id, &err);
                            }
                        }
                    }
                }
            }

            match self.inner.pages.next(&state, &extra) {
                PageDecision::Continue(next) => state = next,
                PageDecision::Stop(StopReason::CapReached) => {
                    warn!(
                        sr_id = %sr.id,
                        max_pages = self.inner.config.max_pages,
                        "page cap reached"
                    );
                    report.truncated = true;
                    return Ok(());
                }
                PageDecision::Stop(reason) => {
                    debug!(sr_id = %sr.id, ?reason, "pagination finished");
                    return Ok(());
                }
            }
        }
    }

    async fn fetch_page(
        &self,
        provider: &Provider,
        sr: &EffectiveServiceRequest,
        query: &QueryContext,
        report: &mut RunReport,
    ) -> Result<OperationResponse, OperationError> {
        let deps = &self.inner.deps;
        deps.rate_gate.acquire(provider.id, sr.rate_limit).await;
        let request = RequestBuilder::new(provider, sr, query, deps.clock.now_secs())
            .build(deps.oauth.as_ref())
            .await?;
        deps.observer.before_send(sr.id, &request);

        let started = Instant::now();
        report.requests += 1;
        let sent = deps.transport.send(&request).await;
        metrics::histogram!("opflow_outbound_request_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        let http_response = sent.map_err(|source| {
            metrics::counter!("opflow_outbound_requests_total", "outcome" => "error").increment(1);
            OperationError::Transport {
                url: request.redacted_url(provider),
                source,
            }
        })?;
        let outcome = if http_response.is_success() { "success" } else { "remote_error" };
        metrics::counter!("opflow_outbound_requests_total", "outcome" => outcome).increment(1);

        let response = ResponseExtractor::new(sr, provider).extract(request, &http_response)?;
        if response.status == ResponseStatus::Error {
            return Err(OperationError::RemoteStatus {
                status: response.http_status,
            });
        }
        Ok(response)
    }

    async fn store_item(
        &self,
        target: &PersistTarget<'_>,
        item: &ExtractedItem,
        query: &QueryContext,
        report: &mut RunReport,
    ) {
        match self.inner.sink.persist(target, item, query).await {
            Ok(InsertOutcome::Inserted) => report.items_inserted += 1,
            Ok(InsertOutcome::Duplicate) => report.items_duplicate += 1,
            Err(err) => {
                warn!(sr_id = %target.sr.id, error = %err, "item not persisted");
                report.record_issue(target.sr.id, &err);
            }
        }
    }

    fn enqueue(
        &self,
        parent: &Job,
        dispatch: ChainDispatch,
        report: &mut RunReport,
        worklist: &mut VecDeque<Job>,
    ) {
        let config = &self.inner.config;
        if dispatch.target == parent.sr_id || parent.path.contains(&dispatch.target) {
            warn!(
                sr_id = %parent.sr_id,
                target = %dispatch.target,
                "chain cycle detected, dispatch dropped"
            );
            report.record_issue(
                parent.sr_id,
                &OperationError::Config(format!(
                    "chain cycle: service request {} is already on the path",
                    dispatch.target
                )),
            );
            return;
        }
        if parent.path.len() + 1 > config.max_chain_depth {
            if !report.truncated {
                warn!(sr_id = %parent.sr_id, max_depth = config.max_chain_depth, "chain depth cap reached");
            }
            report.truncated = true;
            return;
        }
        let dispatched = usize::try_from(report.chained_dispatches).unwrap_or(usize::MAX);
        if dispatched >= config.max_dispatches_per_run {
            if !report.truncated {
                warn!(
                    sr_id = %parent.sr_id,
                    max_dispatches = config.max_dispatches_per_run,
                    "chain dispatch cap reached"
                );
            }
            report.truncated = true;
            return;
        }

        debug!(
            sr_id = %parent.sr_id,
            target = %dispatch.target,
            response_key = %dispatch.response_key,
            "chain dispatch queued"
        );
        report.chained_dispatches += 1;
        let mut path = parent.path.clone();
        path.push(parent.sr_id);
        worklist.push_back(Job {
            sr_id: dispatch.target,
            action: Action::Store,
            query: dispatch.query,
            path,
        });
    }
}

impl TowerService<Operation> for OperationEngine {
    type Response = RunReport;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<RunReport, OperationError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let engine = self.clone();
        Box::pin(async move {
            match op {
                Operation::RunServiceRequest {
                    ctx,
                    sr_id,
                    action,
                    query,
                } => engine.run_operation_for_sr(&ctx, sr_id, action, query).await,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
