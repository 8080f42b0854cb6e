//! HTTP handlers for the trigger surface.
//!
//! `AppState` is the shared state carried through axum extractors. Handler
//! functions are re-exported for the router.

pub mod health;
pub mod run;

pub use health::{health_handler, liveness_handler, metrics_handler, readiness_handler};
pub use run::{execute_handler, run_handler, ApiError, RunRequest};

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use super::{NetworkConfig, ShutdownController};
use crate::service::{OperationPipeline, SchedulerTask, WorkerHandle};

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Everything is behind `Arc` or internally shared, so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Load shed, timeout and metrics wrapped around the engine.
    pub pipeline: OperationPipeline,
    /// Submit side of the scheduler worker. `None` when scheduling is off.
    pub scheduler: Option<WorkerHandle<SchedulerTask>>,
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// Shared with the batch runner so call ids are unique per process.
    pub call_ids: Arc<AtomicU64>,
    /// Per-run timeout applied to manual runs.
    pub run_timeout_ms: u64,
    /// Renders `/metrics`. `None` when no recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
