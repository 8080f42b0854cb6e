//! Manual run and queued-execution endpoints.

use std::sync::atomic::Ordering;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use opflow_core::{Action, Caller, QueryContext, SrId};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower::ServiceExt;
use tracing::{debug, warn};

use super::AppState;
use crate::service::{Operation, OperationContext, OperationError, SchedulerTask, TriggerOrigin};

const CALLER_ID_HEADER: &str = "x-caller-id";
const TENANT_ID_HEADER: &str = "x-tenant-id";
const CALLER_ROLES_HEADER: &str = "x-caller-roles";

/// Body of `POST /service-requests/{id}/run` and `.../execute`. All fields
/// are optional and an empty body is accepted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunRequest {
    pub action: Action,
    pub query: Option<String>,
    pub values: Map<String, Value>,
}

impl RunRequest {
    fn parse(body: &Bytes) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
    }

    fn into_query(self) -> (Action, QueryContext) {
        let mut query = QueryContext::new();
        query.query = self.query;
        for (key, value) in self.values {
            query.insert(key, value);
        }
        (self.action, query)
    }
}

/// Error body returned by the run endpoints.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unavailable(&'static str),
    Operation(OperationError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Operation(err) => match err {
                OperationError::NotFound { .. } => StatusCode::NOT_FOUND,
                OperationError::Unauthorized { .. } => StatusCode::FORBIDDEN,
                OperationError::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
                OperationError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                OperationError::Overloaded | OperationError::Cancelled => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                OperationError::Transport { .. }
                | OperationError::RemoteStatus { .. }
                | OperationError::Extraction(_) => StatusCode::BAD_GATEWAY,
                OperationError::Persistence(_) | OperationError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unavailable(_) => "unavailable",
            Self::Operation(err) => err.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::BadRequest(msg) => msg.clone(),
            Self::Unavailable(msg) => (*msg).to_string(),
            Self::Operation(err) => err.to_string(),
        };
        (status, Json(json!({ "error": self.kind(), "message": message }))).into_response()
    }
}

impl From<OperationError> for ApiError {
    fn from(err: OperationError) -> Self {
        Self::Operation(err)
    }
}

/// Builds the caller identity from the `x-caller-*` headers.
///
/// Missing id means `anonymous`; roles are comma separated.
fn caller_from_headers(headers: &HeaderMap) -> Caller {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    Caller {
        id: header(CALLER_ID_HEADER).unwrap_or("anonymous").to_string(),
        tenant_id: header(TENANT_ID_HEADER).map(str::to_string),
        roles: header(CALLER_ROLES_HEADER)
            .map(|roles| {
                roles
                    .split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// `POST /service-requests/{id}/run`: runs one Sr and waits for the report.
pub async fn run_handler(
    State(state): State<AppState>,
    Path(sr_id): Path<SrId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if !state.shutdown.accepting() {
        return Err(ApiError::Unavailable("server is not accepting runs"));
    }
    let _guard = state.shutdown.in_flight_guard();
    let (action, query) = RunRequest::parse(&body)?.into_query();

    let ctx = OperationContext::new(
        state.call_ids.fetch_add(1, Ordering::Relaxed),
        TriggerOrigin::Manual,
        caller_from_headers(&headers),
        state.run_timeout_ms,
    )
    .with_cancel(state.shutdown.run_token().child_token());
    debug!(sr_id = %sr_id, action = %action, caller = %ctx.caller.id, "manual run");

    let report = state
        .pipeline
        .clone()
        .oneshot(Operation::run(ctx, sr_id, action, query))
        .await?;
    Ok(Json(report))
}

/// `POST /service-requests/{id}/execute`: queues a run on the scheduler and
/// returns 202 without waiting.
pub async fn execute_handler(
    State(state): State<AppState>,
    Path(sr_id): Path<SrId>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if !state.shutdown.accepting() {
        return Err(ApiError::Unavailable("server is not accepting runs"));
    }
    let Some(scheduler) = state.scheduler.as_ref() else {
        return Err(ApiError::Unavailable("scheduler is disabled"));
    };
    let (_, query) = RunRequest::parse(&body)?.into_query();

    if let Err(err) = scheduler.try_submit(SchedulerTask::RunNow { sr_id, query }) {
        warn!(sr_id = %sr_id, error = %err, "could not queue run");
        return Err(ApiError::Unavailable("run queue unavailable"));
    }
    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": sr_id }))))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;
    use crate::network::handlers::test_support::state;
    use crate::service::WorkerHandle;

    async fn status_of(result: Result<impl IntoResponse, ApiError>) -> (StatusCode, Value) {
        let response = result.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn caller_is_read_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CALLER_ID_HEADER, HeaderValue::from_static(" ops-1 "));
        headers.insert(TENANT_ID_HEADER, HeaderValue::from_static("acme"));
        headers.insert(CALLER_ROLES_HEADER, HeaderValue::from_static("admin, ,runner"));

        let caller = caller_from_headers(&headers);
        assert_eq!(caller.id, "ops-1");
        assert_eq!(caller.tenant_id.as_deref(), Some("acme"));
        assert_eq!(caller.roles, vec!["admin", "runner"]);

        let anonymous = caller_from_headers(&HeaderMap::new());
        assert_eq!(anonymous.id, "anonymous");
        assert!(anonymous.roles.is_empty());
    }

    #[test]
    fn run_request_accepts_empty_body_and_values() {
        let empty = RunRequest::parse(&Bytes::from_static(b"  ")).unwrap();
        assert_eq!(empty.action, Action::Store);

        let body = Bytes::from_static(br#"{"action":"return","query":"news","values":{"page":2}}"#);
        let (action, query) = RunRequest::parse(&body).unwrap().into_query();
        assert_eq!(action, Action::Return);
        assert_eq!(query.query.as_deref(), Some("news"));
        assert_eq!(query.get_u64("page"), Some(2));

        assert!(RunRequest::parse(&Bytes::from_static(b"{\"bogus\":1}")).is_err());
    }

    #[tokio::test]
    async fn unknown_service_request_is_404() {
        let state = state(None);
        state.shutdown.set_ready();

        let result = run_handler(State(state), Path(SrId(5)), HeaderMap::new(), Bytes::new()).await;
        let (status, body) = status_of(result).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn runs_are_refused_unless_ready() {
        let state = state(None);
        let result =
            run_handler(State(state.clone()), Path(SrId(5)), HeaderMap::new(), Bytes::new()).await;
        assert_eq!(status_of(result).await.0, StatusCode::SERVICE_UNAVAILABLE);

        state.shutdown.set_ready();
        state.shutdown.trigger_shutdown();
        let result = run_handler(State(state), Path(SrId(5)), HeaderMap::new(), Bytes::new()).await;
        assert_eq!(status_of(result).await.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn malformed_body_is_400() {
        let state = state(None);
        state.shutdown.set_ready();
        let result = run_handler(
            State(state),
            Path(SrId(5)),
            HeaderMap::new(),
            Bytes::from_static(b"{not json"),
        )
        .await;
        let (status, body) = status_of(result).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn execute_queues_run_now() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let state = state(Some(WorkerHandle::from(tx)));
        state.shutdown.set_ready();

        let result = execute_handler(
            State(state),
            Path(SrId(9)),
            Bytes::from_static(br#"{"query":"q"}"#),
        )
        .await;
        let (status, body) = status_of(result).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["queued"], 9);

        match rx.recv().await {
            Some(SchedulerTask::RunNow { sr_id, query }) => {
                assert_eq!(sr_id, SrId(9));
                assert_eq!(query.query.as_deref(), Some("q"));
            }
            other => panic!("unexpected task: {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_without_scheduler_is_503() {
        let state = state(None);
        state.shutdown.set_ready();
        let result = execute_handler(State(state), Path(SrId(9)), Bytes::new()).await;
        assert_eq!(status_of(result).await.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn operation_errors_map_to_statuses() {
        let cases = [
            (OperationError::Config("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (OperationError::Timeout { timeout_ms: 1 }, StatusCode::GATEWAY_TIMEOUT),
            (OperationError::Overloaded, StatusCode::SERVICE_UNAVAILABLE),
            (OperationError::RemoteStatus { status: 500 }, StatusCode::BAD_GATEWAY),
            (OperationError::Persistence("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status_code(), expected);
        }
    }
}
