//! HTTP middleware for the trigger surface.
//!
//! Outermost first:
//! 1. `SetRequestId` -- UUID v4 `x-request-id` unless the caller sent one
//! 2. `SensitiveHeaders` -- keeps `Authorization` out of trace output
//! 3. `Trace` -- request/response spans
//! 4. `Compression` -- gzip, run reports with returned items get large
//! 5. `Cors` -- from `NetworkConfig::cors_origins`
//! 6. `Timeout` -- 408 after `NetworkConfig::request_timeout`; dropping the
//!    handler future drops the run with it
//! 7. `PropagateRequestId` -- echoes `x-request-id` on the response
//!
//! Run admission, run deadlines and run metrics are operation-pipeline
//! layers, not HTTP ones.

use axum::http::header::{HeaderName, AUTHORIZATION};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::sensitive_headers::SetSensitiveRequestHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use super::config::NetworkConfig;

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Wraps every route of `router` in the HTTP middleware stack.
pub fn with_http_layers<S>(router: Router<S>, config: &NetworkConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(REQUEST_ID, MakeRequestUuid))
            .layer(SetSensitiveRequestHeadersLayer::new([AUTHORIZATION]))
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
            .layer(cors_layer(&config.cors_origins))
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                config.request_timeout,
            ))
            .layer(PropagateRequestIdLayer::new(REQUEST_ID)),
    )
}

/// `"*"` anywhere in the list allows every origin. Unparseable entries are
/// logged and skipped.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %origin, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}
