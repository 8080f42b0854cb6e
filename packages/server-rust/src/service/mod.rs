//! Operation engine and its execution framework.
//!
//! 1. **Request assembly** (`request`): effective Sr + context -> `HttpRequest`
//! 2. **Extraction** (`response`, `xml`): decoded body -> items and pagination metadata
//! 3. **Pagination** (`pagination`) and **chaining** (`chain`)
//! 4. **Persistence** (`persistence`): idempotent insert by natural key
//! 5. **Orchestration** (`orchestrator`): the per-run worklist
//! 6. **Middleware** (`middleware`): Tower layers (load shedding, timeout, metrics)
//! 7. **Scheduling** (`scheduler`, `batch`, `worker`): interval ticks and queued runs

pub mod batch;
pub mod chain;
pub mod config;
pub mod middleware;
pub mod operation;
pub mod orchestrator;
pub mod pagination;
pub mod persistence;
pub mod rate_limit;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod worker;
pub mod xml;

// Re-export key types for convenient access.
pub use batch::{BatchFailure, BatchItem, BatchReport, BatchRunner};
pub use config::EngineConfig;
pub use middleware::{build_operation_pipeline, OperationPipeline};
pub use operation::{
    Operation, OperationContext, OperationError, RunIssue, RunReport, RunStatus, TriggerOrigin,
};
pub use orchestrator::{EngineDeps, OperationEngine};
pub use rate_limit::TokenBucketGate;
pub use scheduler::{ScheduleProbe, Scheduler, SchedulerTask};
pub use worker::{BackgroundRunnable, BackgroundWorker, WorkerHandle};
