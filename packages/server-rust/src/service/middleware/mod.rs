//! Tower layers around the operation engine, outermost first: admission
//! ([`load_shed`]), deadline ([`timeout`]), instrumentation ([`metrics`]).
//! [`pipeline`] stacks them.

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_operation_pipeline, OperationPipeline};
pub use timeout::TimeoutLayer;
