//! Transport seam for the lifecycle console backend.
//!
//! Everything above this trait is deterministic and testable without a
//! server: the engine talks to `LifecycleApi`, and the HTTP implementation
//! lives in [`crate::http`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use flightdeck_core::{
    ConsoleEventEnvelope, ConsoleFilters, LifecyclePage, PromotionOutcome,
    PromotionTransitionRequest, RemediationRun, RunApprovalRequest,
};
use thiserror::Error;

pub const MAX_PAGE_LIMIT: u32 = 100;
pub const MAX_RUN_LIMIT: u32 = 10;
pub const DEFAULT_PAGE_LIMIT: u32 = 25;
pub const DEFAULT_RUN_LIMIT: u32 = 5;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response decode failed: {0}")]
    Decode(String),
}

/// One pull request against the workspace collection. Limits are clamped to
/// the backend's bounds at construction so an oversized ask never leaves the
/// process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub filters: ConsoleFilters,
    pub cursor: Option<i64>,
    pub limit: u32,
    pub run_limit: u32,
}

impl PageRequest {
    pub fn new(filters: ConsoleFilters, cursor: Option<i64>) -> Self {
        Self {
            filters,
            cursor,
            limit: DEFAULT_PAGE_LIMIT,
            run_limit: DEFAULT_RUN_LIMIT,
        }
    }

    pub fn with_limits(mut self, limit: u32, run_limit: u32) -> Self {
        self.limit = limit.clamp(1, MAX_PAGE_LIMIT);
        self.run_limit = run_limit.clamp(1, MAX_RUN_LIMIT);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub filters: ConsoleFilters,
    /// Resume cursor, sent as `Last-Event-ID`.
    pub cursor: Option<i64>,
}

/// What the stream transport hands back over its channel. `Closed` is always
/// the final signal for a given subscription.
#[derive(Debug)]
pub enum StreamSignal {
    Event(ConsoleEventEnvelope),
    Closed { detail: String },
}

/// The lifecycle console backend surface the engine consumes. Mutations
/// return the authoritative record so the caller can reconcile its
/// speculative state against it.
#[async_trait]
pub trait LifecycleApi: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<LifecyclePage, ApiError>;

    /// Open the event stream. The receiver yields envelopes until the server
    /// closes or the subscription is dropped; dropping the receiver releases
    /// the connection.
    async fn open_stream(
        &self,
        request: &StreamRequest,
    ) -> Result<mpsc::Receiver<StreamSignal>, ApiError>;

    async fn submit_promotion(
        &self,
        workspace_id: i64,
        revision_id: i64,
        request: &PromotionTransitionRequest,
    ) -> Result<PromotionOutcome, ApiError>;

    async fn submit_run_approval(
        &self,
        run_id: i64,
        request: &RunApprovalRequest,
    ) -> Result<RemediationRun, ApiError>;
}
