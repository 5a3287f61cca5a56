//! Lifecycle synchronization engine.
//!
//! Keeps a local mirror of remediation workspaces converged with the
//! console backend: cursor paging for pull, an SSE subscription for push,
//! a version-gated reconciliation store where the two meet, optimistic
//! actions with rollback, and a sqlite cache for warm starts.

pub mod actions;
pub mod api;
pub mod http;
pub mod session;
pub mod store;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testutil;

pub use actions::{ActionError, ActionExecutor};
pub use api::{
    ApiError, LifecycleApi, PageRequest, StreamRequest, StreamSignal, DEFAULT_PAGE_LIMIT,
    DEFAULT_RUN_LIMIT, MAX_PAGE_LIMIT, MAX_RUN_LIMIT,
};
pub use http::HttpLifecycleApi;
pub use session::{ConsoleSession, SessionCommand, SessionError, SessionUpdate};
pub use store::{PageOutcome, ReconciliationStore};
pub use supervisor::{
    Directive, StreamEvent, StreamState, StreamSupervisor, FALLBACK_POLL_INTERVAL,
    INITIAL_BACKOFF, MAX_BACKOFF,
};
