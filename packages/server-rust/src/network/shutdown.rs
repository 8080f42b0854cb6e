//! Server lifecycle: health state, in-flight manual runs, and the token every
//! run's cancellation derives from.
//!
//! Health lives in an `ArcSwap` so probes read it without locking. Manual runs
//! hold an [`InFlightGuard`]; the last guard to drop wakes the drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Wiring up; runs are refused.
    Starting,
    Ready,
    /// Shutdown began: no new runs, in-flight ones are cancelled and awaited.
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

/// Coordinates readiness and graceful shutdown.
#[derive(Debug)]
pub struct ShutdownController {
    health: ArcSwap<HealthState>,
    in_flight: Arc<InFlight>,
    runs: CancellationToken,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            health: ArcSwap::from_pointee(HealthState::Starting),
            in_flight: Arc::new(InFlight::default()),
            runs: CancellationToken::new(),
        }
    }

    pub fn set_ready(&self) {
        self.health.store(Arc::new(HealthState::Ready));
    }

    /// Moves to Draining and cancels the run token. Runs stop at their next
    /// page or chain boundary.
    pub fn trigger_shutdown(&self) {
        self.health.store(Arc::new(HealthState::Draining));
        self.runs.cancel();
    }

    /// Parent token for run cancellation.
    #[must_use]
    pub fn run_token(&self) -> CancellationToken {
        self.runs.clone()
    }

    /// `true` while new runs may be started.
    #[must_use]
    pub fn accepting(&self) -> bool {
        self.health_state() == HealthState::Ready
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health.load()
    }

    /// Counts a manual run as in flight until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for in-flight runs to finish. On success the
    /// state becomes Stopped; on timeout it stays Draining and `false` is
    /// returned.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let idle = self.in_flight.idle.notified();
                if self.in_flight_count() == 0 {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok();

        if drained {
            self.health.store(Arc::new(HealthState::Stopped));
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop decrements the in-flight count, also during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_gates_accepting() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Starting);
        assert!(!controller.accepting());

        controller.set_ready();
        assert!(controller.accepting());

        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert!(!controller.accepting());
    }

    #[test]
    fn shutdown_cancels_derived_run_tokens() {
        let controller = ShutdownController::new();
        let run = controller.run_token().child_token();
        let nested = run.child_token();
        assert!(!nested.is_cancelled());

        controller.trigger_shutdown();
        assert!(run.is_cancelled());
        assert!(nested.is_cancelled());
    }

    #[test]
    fn guards_track_in_flight_runs() {
        let controller = ShutdownController::new();
        let a = controller.in_flight_guard();
        let b = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);
        drop(a);
        assert_eq!(controller.in_flight_count(), 1);
        drop(b);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn drain_with_nothing_in_flight_stops_immediately() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        assert!(controller.wait_for_drain(Duration::from_millis(1)).await);
        assert_eq!(controller.health_state().as_str(), "stopped");
    }

    #[tokio::test]
    async fn drain_waits_for_last_guard() {
        let controller = Arc::new(ShutdownController::new());
        controller.set_ready();
        let guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_leaves_state_draining() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(controller.health_state(), HealthState::Draining);
    }
}
