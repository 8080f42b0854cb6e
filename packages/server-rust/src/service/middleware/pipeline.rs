//! Assembly of the run pipeline.

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use super::timeout::{TimeoutLayer, TimeoutService};
use crate::service::config::EngineConfig;
use crate::service::orchestrator::OperationEngine;

/// What the HTTP handlers and the scheduler call. Clones share the
/// admission semaphore.
pub type OperationPipeline = LoadShedService<TimeoutService<MetricsService<OperationEngine>>>;

/// Wraps `engine` so that runs are admitted first, then given their deadline,
/// then measured. Shed runs are counted by the load-shed layer alone, and a
/// run cut off by its deadline drops out of the metrics span unrecorded.
#[must_use]
pub fn build_operation_pipeline(engine: OperationEngine, config: &EngineConfig) -> OperationPipeline {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_runs))
        .layer(TimeoutLayer)
        .layer(MetricsLayer)
        .service(engine)
}
