/// Engine-level configuration for the operation pipeline.
///
/// Controls iteration caps, concurrency limits, timeouts, and scheduler
/// cadence.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Page size used when no `page_size` response key supplies one.
    pub default_page_size: u64,
    /// Maximum requests for one Sr within a run (pagination cap).
    pub max_pages: u32,
    /// Maximum chain-link hops below the root Sr.
    pub max_chain_depth: usize,
    /// Maximum chained dispatches across a whole run.
    pub max_dispatches_per_run: usize,
    /// Independent Srs run concurrently by the batch runner.
    pub max_concurrent_srs: usize,
    /// Runs in flight across all origins before new ones are rejected.
    pub max_concurrent_runs: u32,
    /// Default timeout for a top-level run in milliseconds.
    pub default_operation_timeout_ms: u64,
    /// Skip, instead of abort, a chain dispatch whose forwarded field is
    /// missing from the item.
    pub skip_missing_forwarded_fields: bool,
    /// Interval between scheduler ticks in milliseconds.
    pub scheduler_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_page_size: 100,
            max_pages: 100,
            max_chain_depth: 8,
            max_dispatches_per_run: 1_000,
            max_concurrent_srs: 4,
            max_concurrent_runs: 64,
            default_operation_timeout_ms: 300_000,
            skip_missing_forwarded_fields: false,
            scheduler_tick_ms: 15_000,
        }
    }
}
