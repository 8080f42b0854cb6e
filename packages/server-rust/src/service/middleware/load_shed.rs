//! Admission control for runs.
//!
//! At most `max_concurrent_runs` runs execute at once across every origin.
//! A run arriving when no slot is free is refused with
//! [`OperationError::Overloaded`] instead of waiting.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Semaphore;
use tower::{Layer, Service};
use tracing::warn;

use crate::service::operation::{Operation, OperationError, RunReport};

/// Shares one pool of run slots between every service it wraps.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    slots: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent_runs: u32) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent_runs as usize)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            slots: Arc::clone(&self.slots),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    slots: Arc<Semaphore>,
}

impl<S> LoadShedService<S> {
    /// Run slots currently free.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

impl<S> Service<Operation> for LoadShedService<S>
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
        let Ok(slot) = Arc::clone(&self.slots).try_acquire_owned() else {
            let origin = op.ctx().origin.as_str();
            warn!(sr_id = %op.sr_id(), origin, "run shed: no free run slot");
            metrics::counter!("opflow_runs_shed_total", "origin" => origin).increment(1);
            return Box::pin(async { Err(OperationError::Overloaded) });
        };

        let run = self.inner.call(op);
        Box::pin(async move {
            let result = run.await;
            drop(slot);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use opflow_core::{Action, Caller, QueryContext, SrId};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::service::operation::{OperationContext, TriggerOrigin};

    /// Holds every run until `release` is cancelled.
    #[derive(Clone)]
    struct Gate {
        release: CancellationToken,
    }

    impl Service<Operation> for Gate {
        type Response = RunReport;
        type Error = OperationError;
        type Future = Pin<Box<dyn Future<Output = Result<RunReport, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, op: Operation) -> Self::Future {
            let release = self.release.clone();
            let sr_id = op.sr_id();
            Box::pin(async move {
                release.cancelled().await;
                Ok(RunReport::new("held", sr_id))
            })
        }
    }

    fn run(sr: u64, origin: TriggerOrigin) -> Operation {
        let ctx = OperationContext::new(sr, origin, Caller::system(), 5_000);
        Operation::run(ctx, SrId(sr), Action::Store, QueryContext::new())
    }

    #[tokio::test]
    async fn second_run_is_shed_while_the_only_slot_is_held() {
        let release = CancellationToken::new();
        let mut svc = LoadShedLayer::new(1).layer(Gate {
            release: release.clone(),
        });

        let held = tokio::spawn(svc.call(run(1, TriggerOrigin::Schedule)));
        assert_eq!(svc.free_slots(), 0);

        let err = svc.call(run(2, TriggerOrigin::Manual)).await.unwrap_err();
        assert!(matches!(err, OperationError::Overloaded));

        release.cancel();
        let report = held.await.unwrap().unwrap();
        assert_eq!(report.sr_id, SrId(1));
        assert_eq!(svc.free_slots(), 1);
    }

    #[tokio::test]
    async fn slots_are_shared_between_wrapped_services() {
        let layer = LoadShedLayer::new(2);
        let release = CancellationToken::new();
        let mut a = layer.layer(Gate {
            release: release.clone(),
        });
        let mut b = layer.layer(Gate {
            release: release.clone(),
        });

        let first = tokio::spawn(a.call(run(1, TriggerOrigin::Queued)));
        assert_eq!(b.free_slots(), 1);
        let second = tokio::spawn(b.call(run(2, TriggerOrigin::Manual)));

        let err = a.call(run(3, TriggerOrigin::Manual)).await.unwrap_err();
        assert!(matches!(err, OperationError::Overloaded));

        release.cancel();
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(a.free_slots(), 2);
    }
}
