//! Operation types carried through the engine pipeline.

use opflow_core::{Action, Caller, QueryContext, SrId};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// What triggered an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOrigin {
    /// Ad-hoc test run through the HTTP surface.
    Manual,
    /// Interval scheduler tick.
    Schedule,
    /// Queued "execute immediately" event.
    Queued,
}

impl TriggerOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Schedule => "schedule",
            Self::Queued => "queued",
        }
    }
}

/// Context carried with every operation through the pipeline.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub call_id: u64,
    pub origin: TriggerOrigin,
    pub caller: Caller,
    pub call_timeout_ms: u64,
    /// Cancelled by shutdown or by whoever started the run.
    pub cancel: CancellationToken,
}

impl OperationContext {
    #[must_use]
    pub fn new(call_id: u64, origin: TriggerOrigin, caller: Caller, call_timeout_ms: u64) -> Self {
        Self {
            call_id,
            origin,
            caller,
            call_timeout_ms,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Typed operations dispatched through the pipeline.
#[derive(Debug)]
#[non_exhaustive]
pub enum Operation {
    /// Run one service request with its pagination and chained dispatches.
    RunServiceRequest {
        ctx: OperationContext,
        sr_id: SrId,
        action: Action,
        query: QueryContext,
    },
}

impl Operation {
    #[must_use]
    pub fn run(ctx: OperationContext, sr_id: SrId, action: Action, query: QueryContext) -> Self {
        Self::RunServiceRequest {
            ctx,
            sr_id,
            action,
            query,
        }
    }

    #[must_use]
    pub fn ctx(&self) -> &OperationContext {
        match self {
            Self::RunServiceRequest { ctx, .. } => ctx,
        }
    }

    #[must_use]
    pub fn sr_id(&self) -> SrId {
        match self {
            Self::RunServiceRequest { sr_id, .. } => *sr_id,
        }
    }
}

/// Errors returned by the engine.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// A required config item is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),
    #[error("transport error calling {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    /// Unsupported content type, undecodable body, or missing forwarded field.
    #[error("extraction error: {0}")]
    Extraction(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("remote endpoint returned status {status}")]
    RemoteStatus { status: u16 },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },
    #[error("caller {caller} is not allowed to run service request {sr_id}")]
    Unauthorized { caller: String, sr_id: SrId },
    #[error("run cancelled")]
    Cancelled,
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("server overloaded")]
    Overloaded,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OperationError {
    /// Short machine-readable category, used in reports and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Transport { .. } => "transport",
            Self::Extraction(_) => "extraction",
            Self::Persistence(_) => "persistence",
            Self::RemoteStatus { .. } => "remote_status",
            Self::NotFound { .. } => "not_found",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Cancelled => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::Overloaded => "overloaded",
            Self::Internal(_) => "internal",
        }
    }
}

/// A non-fatal failure recorded while a run kept going.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunIssue {
    pub sr_id: SrId,
    pub kind: &'static str,
    pub message: String,
}

impl RunIssue {
    #[must_use]
    pub fn from_error(sr_id: SrId, err: &OperationError) -> Self {
        Self {
            sr_id,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// The first page extracted no items.
    NothingToDo,
}

/// Outcome of one top-level invocation, including all pages and chains.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub sr_id: SrId,
    pub status: RunStatus,
    /// HTTP requests issued across the whole run.
    pub requests: u32,
    pub items_extracted: u64,
    pub items_inserted: u64,
    pub items_duplicate: u64,
    pub chained_dispatches: u64,
    /// A page, depth or dispatch cap stopped the run early.
    pub truncated: bool,
    pub issues: Vec<RunIssue>,
    /// Root items, returned only for [`Action::Return`].
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Map<String, Value>>,
}

impl RunReport {
    #[must_use]
    pub fn new(run_id: impl Into<String>, sr_id: SrId) -> Self {
        Self {
            run_id: run_id.into(),
            sr_id,
            status: RunStatus::Completed,
            requests: 0,
            items_extracted: 0,
            items_inserted: 0,
            items_duplicate: 0,
            chained_dispatches: 0,
            truncated: false,
            issues: Vec::new(),
            items: Vec::new(),
        }
    }

    pub fn record_issue(&mut self, sr_id: SrId, err: &OperationError) {
        self.issues.push(RunIssue::from_error(sr_id, err));
    }
}
