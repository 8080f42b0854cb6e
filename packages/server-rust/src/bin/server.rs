//! `opflow-server`: loads the catalog, starts the scheduler and serves the
//! HTTP trigger surface until Ctrl-C.

use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use opflow_core::{ConfigSource, SystemClock};
use opflow_server::catalog::Catalog;
use opflow_server::network::{AppState, NetworkConfig, NetworkModule, ShutdownController};
use opflow_server::service::{
    build_operation_pipeline, BackgroundWorker, BatchRunner, EngineConfig, EngineDeps,
    OperationEngine, ScheduleProbe, Scheduler, SchedulerTask, TokenBucketGate,
};
use opflow_server::storage::MemoryDocumentStore;
use opflow_server::transport::{
    ClientCredentialsTokenSource, HttpTransportConfig, ReqwestTransport,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "opflow-server", version, about = "Runs configured service requests against third-party APIs")]
struct Args {
    /// JSON catalog of providers, services and service requests.
    #[arg(long, env = "OPFLOW_CATALOG")]
    catalog: PathBuf,

    #[arg(long, env = "OPFLOW_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "OPFLOW_PORT", default_value_t = 8080)]
    port: u16,

    /// Maximum requests per Sr within one run.
    #[arg(long, env = "OPFLOW_MAX_PAGES")]
    max_pages: Option<u32>,

    #[arg(long, env = "OPFLOW_MAX_CHAIN_DEPTH")]
    max_chain_depth: Option<usize>,

    /// Independent Srs run concurrently per scheduler batch.
    #[arg(long, env = "OPFLOW_MAX_CONCURRENT_SRS")]
    max_concurrent_srs: Option<usize>,

    #[arg(long, env = "OPFLOW_RUN_TIMEOUT_MS")]
    run_timeout_ms: Option<u64>,

    #[arg(long, env = "OPFLOW_SCHEDULER_TICK_MS")]
    scheduler_tick_ms: Option<u64>,

    /// Serve manual runs only.
    #[arg(long, env = "OPFLOW_NO_SCHEDULER")]
    no_scheduler: bool,

    /// Do not install the Prometheus recorder.
    #[arg(long, env = "OPFLOW_NO_METRICS")]
    no_metrics: bool,

    #[arg(long, env = "OPFLOW_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            max_pages: self.max_pages.unwrap_or(defaults.max_pages),
            max_chain_depth: self.max_chain_depth.unwrap_or(defaults.max_chain_depth),
            max_concurrent_srs: self.max_concurrent_srs.unwrap_or(defaults.max_concurrent_srs),
            default_operation_timeout_ms: self
                .run_timeout_ms
                .unwrap_or(defaults.default_operation_timeout_ms),
            scheduler_tick_ms: self.scheduler_tick_ms.unwrap_or(defaults.scheduler_tick_ms),
            ..defaults
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,opflow_server=debug".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let metrics = if args.no_metrics {
        None
    } else {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {e}"))?,
        )
    };

    let catalog = Arc::new(
        Catalog::load(&args.catalog)
            .with_context(|| format!("loading catalog {}", args.catalog.display()))?,
    );
    let config_source: Arc<dyn ConfigSource> = catalog.clone();
    let engine_config = args.engine_config();

    let http = HttpTransportConfig::default();
    let transport = ReqwestTransport::new(&http)?;
    let oauth_client = reqwest::Client::builder()
        .timeout(Duration::from_millis(http.timeout_ms))
        .user_agent(http.user_agent.clone())
        .build()?;

    let deps = EngineDeps::new(
        config_source.clone(),
        Arc::new(transport),
        Arc::new(MemoryDocumentStore::new()),
        Arc::new(ClientCredentialsTokenSource::new(oauth_client)),
    )
    .with_rate_gate(Arc::new(TokenBucketGate::new(None)))
    .with_cancellation_probe(Arc::new(ScheduleProbe::new(config_source.clone())));
    let engine = OperationEngine::new(deps, engine_config.clone());
    let pipeline = build_operation_pipeline(engine, &engine_config);

    let shutdown = Arc::new(ShutdownController::new());
    let call_ids = Arc::new(AtomicU64::new(1));

    let mut worker = if args.no_scheduler {
        None
    } else {
        let runner = BatchRunner::new(
            pipeline.clone(),
            engine_config.max_concurrent_srs,
            engine_config.default_operation_timeout_ms,
            call_ids.clone(),
            shutdown.run_token(),
        );
        let scheduler = Scheduler::new(config_source.clone(), runner, Arc::new(SystemClock));
        let worker = BackgroundWorker::start(scheduler, engine_config.scheduler_tick_ms);
        worker.submit(SchedulerTask::RunStartupSchedules).await?;
        Some(worker)
    };

    let state = AppState {
        pipeline,
        scheduler: worker.as_ref().and_then(BackgroundWorker::handle),
        shutdown: shutdown.clone(),
        config: Arc::new(NetworkConfig {
            host: args.host.clone(),
            port: args.port,
            ..NetworkConfig::default()
        }),
        call_ids,
        run_timeout_ms: engine_config.default_operation_timeout_ms,
        metrics,
        start_time: Instant::now(),
    };

    #[cfg(unix)]
    spawn_reload_on_sighup(catalog.clone())?;

    let mut network = NetworkModule::new(state);
    let port = network.start().await?;
    info!(port, catalog = %args.catalog.display(), "opflow-server started");

    let signal_shutdown = shutdown.clone();
    network
        .serve(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
            signal_shutdown.trigger_shutdown();
        })
        .await?;

    if let Some(worker) = worker.as_mut() {
        worker.stop().await;
    }
    info!("opflow-server stopped");
    Ok(())
}

/// Re-reads the catalog file on SIGHUP. A bad file keeps the old catalog.
#[cfg(unix)]
fn spawn_reload_on_sighup(catalog: Arc<Catalog>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            match catalog.reload() {
                Ok(()) => info!("catalog reloaded"),
                Err(e) => warn!(error = %e, "catalog reload failed, keeping previous"),
            }
        }
    });
    Ok(())
}
