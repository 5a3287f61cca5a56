//! Wire contracts and domain model for the remediation flight deck.
//!
//! Everything in this crate is pure data plus deterministic merge logic:
//! the page/stream envelopes served by the lifecycle console backend, the
//! workspace/revision/run records they carry, the SSE frame decoder used by
//! the streaming transport, and the field-wise delta merge rules. No I/O.

pub mod filters;
pub mod merge;
pub mod model;
pub mod sse;
pub mod wire;

pub use filters::{ConsoleFilters, FilterError, Severity};
pub use merge::MergeError;
pub use model::{
    ApprovalState, ArtifactFingerprint, GateCheckSnapshot, IntelligenceScore, LifecycleState,
    MarketplaceReadiness, PromotionStatus, PromotionVerdict, RemediationRun, RetryAttempt,
    RunOverride, RunStatus, TrustState, Workspace, WorkspaceRevision,
};
pub use sse::{DecodeReport, FrameError, SseFrame, SseFrameDecoder, DEFAULT_MAX_FRAME_BYTES};
pub use wire::{
    ConsoleDelta, ConsoleEventEnvelope, ConsoleEventType, FieldChange, LifecyclePage,
    PromotionOutcome, PromotionTransitionRequest, RevisionSnapshot, RunApprovalRequest, RunDelta,
    RunSnapshot, WorkspaceDelta, WorkspaceSnapshot,
};
