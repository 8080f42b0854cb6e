//! Network module with deferred startup lifecycle.
//!
//! `new()` takes the assembled application state, `start()` binds the TCP
//! listener, and `serve()` accepts connections until shutdown. The bound
//! port is known between `start()` and `serve()`, which tests rely on.

use std::future::Future;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::handlers::{
    execute_handler, health_handler, liveness_handler, metrics_handler, readiness_handler,
    run_handler, AppState,
};
use super::middleware::with_http_layers;
use super::shutdown::ShutdownController;

/// Owns the HTTP trigger surface.
///
/// 1. `new()` -- keeps the shared state, binds nothing
/// 2. `start()` -- binds TCP listener to the configured address
/// 3. `serve()` -- accepts connections until shutdown is signalled, then drains
pub struct NetworkModule {
    state: AppState,
    listener: Option<TcpListener>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            listener: None,
        }
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- liveness probe
    /// - `GET /health/ready` -- readiness probe
    /// - `GET /metrics` -- Prometheus exposition
    /// - `POST /service-requests/{id}/run` -- run one Sr and return its report
    /// - `POST /service-requests/{id}/execute` -- queue a run, 202
    pub fn build_router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which differs from the configured
    /// port when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let config = &self.state.config;
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until the shutdown signal fires.
    ///
    /// After the signal: health goes to Draining, run tokens are cancelled,
    /// and in-flight runs get `drain_timeout` to finish before Stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server hits
    /// a fatal I/O error.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let Some(listener) = self.listener else {
            anyhow::bail!("start() must be called before serve()");
        };
        let shutdown_ctrl = Arc::clone(&self.state.shutdown);
        let drain_timeout = self.state.config.drain_timeout;
        let router = build_router(self.state);

        shutdown_ctrl.set_ready();
        info!("Serving HTTP trigger surface");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        shutdown_ctrl.trigger_shutdown();
        if shutdown_ctrl.wait_for_drain(drain_timeout).await {
            info!("All in-flight runs drained");
        } else {
            warn!(
                in_flight = shutdown_ctrl.in_flight_count(),
                "Drain timeout expired with runs still in flight"
            );
        }
        Ok(())
    }
}

fn build_router(state: AppState) -> Router {
    let config = Arc::clone(&state.config);
    let routes = Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/service-requests/{id}/run", post(run_handler))
        .route("/service-requests/{id}/execute", post(execute_handler));
    with_http_layers(routes, &config).with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::network::handlers::test_support::state;

    #[test]
    fn new_creates_module_without_binding() {
        let module = NetworkModule::new(state(None));
        assert!(module.listener.is_none());
    }

    #[test]
    fn shutdown_controller_returns_shared_arc() {
        let module = NetworkModule::new(state(None));
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.shutdown_controller()
        ));
    }

    #[tokio::test]
    async fn router_serves_probes_and_runs() {
        let module = NetworkModule::new(state(None));
        module.shutdown_controller().set_ready();
        let router = module.build_router();

        let live = router
            .clone()
            .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(live.status(), StatusCode::OK);
        assert!(live.headers().contains_key("x-request-id"));

        let run = router
            .oneshot(
                Request::post("/service-requests/77/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(run.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = NetworkModule::new(state(None));
        let port = module.start().await.expect("start should succeed");
        assert!(port > 0, "OS-assigned port should be > 0");
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let module = NetworkModule::new(state(None));
        let err = module.serve(std::future::pending::<()>()).await.unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serve_drains_and_stops_on_signal() {
        let mut module = NetworkModule::new(state(None));
        let shutdown = module.shutdown_controller();
        module.start().await.unwrap();

        module.serve(async {}).await.unwrap();
        assert!(!shutdown.accepting());
        assert!(shutdown.run_token().is_cancelled());
    }
}
