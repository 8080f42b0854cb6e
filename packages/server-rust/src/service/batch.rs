//! Concurrent runs of independent service requests.
//!
//! Each run goes through the full pipeline. A failing Sr is reported and
//! never affects its siblings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use opflow_core::{Action, Caller, QueryContext, SrId};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing::{error, warn};

use crate::service::middleware::OperationPipeline;
use crate::service::operation::{
    Operation, OperationContext, OperationError, RunReport, TriggerOrigin,
};

/// One Sr to run in a batch.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub sr_id: SrId,
    pub query: QueryContext,
}

/// Outcome of a batch.
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<RunReport>,
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub sr_id: SrId,
    pub kind: &'static str,
    pub message: String,
}

/// Runs batches of Srs with bounded concurrency.
#[derive(Clone)]
pub struct BatchRunner<S = OperationPipeline> {
    pipeline: S,
    permits: Arc<Semaphore>,
    call_ids: Arc<AtomicU64>,
    timeout_ms: u64,
    shutdown: CancellationToken,
}

impl<S> BatchRunner<S>
where
    S: Service<Operation, Response = RunReport, Error = OperationError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    #[must_use]
    pub fn new(
        pipeline: S,
        max_concurrent: usize,
        timeout_ms: u64,
        call_ids: Arc<AtomicU64>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pipeline,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            call_ids,
            timeout_ms,
            shutdown,
        }
    }

    /// Runs every item and waits for all of them.
    pub async fn run_all(&self, origin: TriggerOrigin, items: Vec<BatchItem>) -> BatchReport {
        let mut set = JoinSet::new();
        for item in items {
            let runner = self.clone();
            set.spawn(async move {
                let sr_id = item.sr_id;
                (sr_id, runner.run_one(origin, item).await)
            });
        }

        let mut report = BatchReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(run))) => report.succeeded.push(run),
                Ok((sr_id, Err(failure))) => {
                    warn!(sr_id = %sr_id, kind = failure.kind, error = %failure.message, "run failed");
                    report.failures.push(failure);
                }
                Err(join_err) => error!(error = %join_err, "run task panicked"),
            }
        }
        report
    }

    /// Runs one item once a concurrency permit is free.
    ///
    /// # Errors
    ///
    /// Returns a [`BatchFailure`] describing the run's error.
    pub async fn run_one(
        &self,
        origin: TriggerOrigin,
        item: BatchItem,
    ) -> Result<RunReport, BatchFailure> {
        let _permit = self.permits.acquire().await.map_err(|_| BatchFailure {
            sr_id: item.sr_id,
            kind: "cancelled",
            message: "batch runner closed".to_string(),
        })?;

        let ctx = OperationContext::new(
            self.call_ids.fetch_add(1, Ordering::Relaxed),
            origin,
            Caller::system(),
            self.timeout_ms,
        )
        .with_cancel(self.shutdown.child_token());
        let op = Operation::run(ctx, item.sr_id, Action::Store, item.query);

        self.pipeline
            .clone()
            .oneshot(op)
            .await
            .map_err(|e| BatchFailure {
                sr_id: item.sr_id,
                kind: e.kind(),
                message: e.to_string(),
            })
    }
}
