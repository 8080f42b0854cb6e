//! Deadline for whole runs.
//!
//! A run that outlives its `call_timeout_ms` fails with
//! [`OperationError::Timeout`] and its cancellation token is fired, so work
//! already handed to spawned tasks stops at the next page or chain boundary.
//! A timeout of 0 disables the deadline.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};
use tracing::warn;

use crate::service::operation::{Operation, OperationError, RunReport};

/// Reads the deadline from each operation's context.
#[derive(Debug, Clone)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<Operation> for TimeoutService<S>
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
        let ctx = op.ctx();
        let timeout_ms = ctx.call_timeout_ms;
        let cancel = ctx.cancel.clone();
        let sr_id = op.sr_id();
        let run = self.inner.call(op);

        if timeout_ms == 0 {
            return Box::pin(run);
        }
        Box::pin(async move {
            if let Ok(result) = tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
                return result;
            }
            cancel.cancel();
            warn!(sr_id = %sr_id, timeout_ms, "run deadline exceeded");
            Err(OperationError::Timeout { timeout_ms })
        })
    }
}

#[cfg(test)]
mod tests {
    use opflow_core::{Action, Caller, QueryContext, SrId};
    use tower::ServiceExt;

    use super::*;
    use crate::service::operation::{OperationContext, TriggerOrigin};

    /// Sleeps `pages * 10ms`, checking the run token between "pages".
    struct Paged {
        pages: u32,
    }

    impl Service<Operation> for Paged {
        type Response = RunReport;
        type Error = OperationError;
        type Future = Pin<Box<dyn Future<Output = Result<RunReport, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, op: Operation) -> Self::Future {
            let pages = self.pages;
            let sr_id = op.sr_id();
            let cancel = op.ctx().cancel.clone();
            Box::pin(async move {
                let mut report = RunReport::new("paged", sr_id);
                for _ in 0..pages {
                    if cancel.is_cancelled() {
                        return Err(OperationError::Cancelled);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    report.requests += 1;
                }
                Ok(report)
            })
        }
    }

    fn op(timeout_ms: u64) -> Operation {
        let ctx = OperationContext::new(1, TriggerOrigin::Schedule, Caller::system(), timeout_ms);
        Operation::run(ctx, SrId(8), Action::Store, QueryContext::new())
    }

    #[tokio::test(start_paused = true)]
    async fn run_within_deadline_returns_its_report() {
        let report = TimeoutLayer
            .layer(Paged { pages: 3 })
            .oneshot(op(1_000))
            .await
            .unwrap();
        assert_eq!(report.requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn late_run_times_out_and_is_cancelled() {
        let op = op(25);
        let cancel = op.ctx().cancel.clone();
        let err = TimeoutLayer
            .layer(Paged { pages: 10 })
            .oneshot(op)
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Timeout { timeout_ms: 25 }));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_disables_the_deadline() {
        let report = TimeoutLayer
            .layer(Paged { pages: 50 })
            .oneshot(op(0))
            .await
            .unwrap();
        assert_eq!(report.requests, 50);
    }
}
