use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{
    ApprovalState, ArtifactFingerprint, GateCheckSnapshot, LifecycleState, PromotionStatus,
    PromotionVerdict, RemediationRun, RetryAttempt, RunOverride, RunStatus, Workspace,
    WorkspaceRevision,
};

/// One run plus the posture sub-objects the console backend joins onto it.
/// `intelligence` is keyed by capability name so delta field changes can
/// address individual capabilities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSnapshot {
    pub run: RemediationRun,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust: Option<crate::model::TrustState>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub intelligence: BTreeMap<String, crate::model::IntelligenceScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marketplace: Option<crate::model::MarketplaceReadiness>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevisionSnapshot {
    pub revision: WorkspaceRevision,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gate_snapshots: Vec<GateCheckSnapshot>,
}

/// Full point-in-time view of one workspace: the unit both the pager and
/// the stream deliver, and the unit the store keys by identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceSnapshot {
    pub workspace: Workspace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_revision: Option<RevisionSnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_runs: Vec<RunSnapshot>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub promotion_postures: BTreeMap<String, Value>,
}

impl WorkspaceSnapshot {
    pub fn run(&self, run_id: i64) -> Option<&RunSnapshot> {
        self.recent_runs.iter().find(|entry| entry.run.id == run_id)
    }

    pub fn run_mut(&mut self, run_id: i64) -> Option<&mut RunSnapshot> {
        self.recent_runs
            .iter_mut()
            .find(|entry| entry.run.id == run_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecyclePage {
    #[serde(default)]
    pub workspaces: Vec<WorkspaceSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConsoleEventType {
    Snapshot,
    Heartbeat,
    Error,
}

/// Envelope carried in every SSE `data:` payload from the lifecycle stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsoleEventEnvelope {
    #[serde(rename = "type")]
    pub event_type: ConsoleEventType,
    pub emitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<LifecyclePage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<ConsoleDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Field-level change record for the trust/intelligence/marketplace
/// sub-objects and promotion postures. `current: None` removes the field
/// (only meaningful for keyed entries such as capabilities and postures).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldChange {
    pub field: String,
    #[serde(default)]
    pub previous: Option<Value>,
    #[serde(default)]
    pub current: Option<Value>,
}

/// Partial run document. Absence of a field means "unchanged", never
/// "cleared"; the merge layer only touches fields that are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunDelta {
    pub run_id: i64,
    #[serde(default)]
    pub playbook: Option<String>,
    #[serde(default)]
    pub revision_id: Option<i64>,
    #[serde(default)]
    pub approval_required: Option<bool>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub approval_state: Option<ApprovalState>,
    #[serde(default)]
    pub approval_decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approval_notes: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub retry_attempt: Option<u32>,
    #[serde(default)]
    pub retry_limit: Option<u32>,
    #[serde(default)]
    pub retry_ledger: Option<Vec<RetryAttempt>>,
    #[serde(default)]
    pub override_provenance: Option<RunOverride>,
    #[serde(default)]
    pub promotion_verdict: Option<PromotionVerdict>,
    #[serde(default)]
    pub artifacts: Option<Vec<ArtifactFingerprint>>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trust_changes: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intelligence_changes: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marketplace_changes: Vec<FieldChange>,
}

impl RunDelta {
    pub fn new(run_id: i64) -> Self {
        Self {
            run_id,
            ..Self::default()
        }
    }
}

/// Diff envelope scoped to one workspace. `removed: true` is the only signal
/// that destroys a workspace client-side; absence from a later page never is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceDelta {
    pub workspace_id: i64,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub lifecycle_state: Option<LifecycleState>,
    #[serde(default)]
    pub active_revision: Option<RevisionSnapshot>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_upserts: Vec<RunDelta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_run_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gate_upserts: Vec<GateCheckSnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_gate_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub posture_changes: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_postures: Vec<String>,
}

impl WorkspaceDelta {
    pub fn new(workspace_id: i64) -> Self {
        Self {
            workspace_id,
            removed: false,
            lifecycle_state: None,
            active_revision: None,
            version: None,
            updated_at: None,
            run_upserts: Vec::new(),
            removed_run_ids: Vec::new(),
            gate_upserts: Vec::new(),
            removed_gate_ids: Vec::new(),
            posture_changes: Vec::new(),
            removed_postures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConsoleDelta {
    #[serde(default)]
    pub workspaces: Vec<WorkspaceDelta>,
}

/// Body of the authoritative promotion mutation. Expected versions are the
/// optimistic-lock tokens captured before the speculative local apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionTransitionRequest {
    pub promotion_status: PromotionStatus,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub gate_context: Value,
    pub expected_workspace_version: i64,
    pub expected_revision_version: i64,
}

/// Confirmation payload for a promotion transition: the authoritative
/// workspace and revision records after the mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionOutcome {
    pub workspace: Workspace,
    pub revision: WorkspaceRevision,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunApprovalRequest {
    pub new_state: ApprovalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_notes: Option<String>,
    pub expected_version: i64,
}
