//! Run instrumentation.
//!
//! Every run gets a `run` span. On completion the layer records the run
//! counter and duration histogram by origin and outcome, plus item totals
//! taken from the report.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info, info_span, Instrument};

use crate::service::operation::{Operation, OperationError, RunReport, RunStatus};

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

/// Label for a finished run: `ok`, `nothing_to_do`, `truncated`, `partial`
/// (issues were recorded) or the error kind.
fn outcome(result: &Result<RunReport, OperationError>) -> &'static str {
    match result {
        Ok(report) if !report.issues.is_empty() => "partial",
        Ok(report) if report.truncated => "truncated",
        Ok(report) if report.status == RunStatus::NothingToDo => "nothing_to_do",
        Ok(_) => "ok",
        Err(e) => e.kind(),
    }
}

impl<S> Service<Operation> for MetricsService<S>
where
    S: Service<Operation, Response = RunReport, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = RunReport;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<RunReport, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let origin = op.ctx().origin.as_str();
        let span = info_span!(
            "run",
            sr_id = op.sr_id().0,
            origin,
            call_id = op.ctx().call_id,
            caller = %op.ctx().caller.id,
        );
        let run = self.inner.call(op);

        Box::pin(
            async move {
                let started = Instant::now();
                let result = run.await;
                let elapsed = started.elapsed();
                let outcome = outcome(&result);

                metrics::counter!("opflow_runs_total", "origin" => origin, "outcome" => outcome)
                    .increment(1);
                metrics::histogram!("opflow_run_duration_seconds", "origin" => origin)
                    .record(elapsed.as_secs_f64());

                if let Ok(report) = &result {
                    metrics::counter!("opflow_items_inserted_total", "origin" => origin)
                        .increment(report.items_inserted);
                    metrics::counter!("opflow_items_duplicate_total", "origin" => origin)
                        .increment(report.items_duplicate);
                    info!(
                        outcome,
                        elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                        requests = report.requests,
                        inserted = report.items_inserted,
                        chained = report.chained_dispatches,
                        "run complete"
                    );
                } else {
                    info!(
                        outcome,
                        elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                        "run failed"
                    );
                }
                result
            }
            .instrument(span),
        )
    }
}
