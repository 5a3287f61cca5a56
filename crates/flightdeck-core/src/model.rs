use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Workspace lane. The backend owns the closed set; unknown values fail
/// deserialization rather than being silently coerced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Draft,
    Active,
    Suspended,
    Retired,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Draft => "draft",
            LifecycleState::Active => "active",
            LifecycleState::Suspended => "suspended",
            LifecycleState::Retired => "retired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(LifecycleState::Draft),
            "active" => Some(LifecycleState::Active),
            "suspended" => Some(LifecycleState::Suspended),
            "retired" => Some(LifecycleState::Retired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
    RolledBack,
}

impl PromotionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PromotionStatus::Pending => "pending",
            PromotionStatus::Approved => "approved",
            PromotionStatus::Rejected => "rejected",
            PromotionStatus::Completed => "completed",
            PromotionStatus::RolledBack => "rolled_back",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Approved,
    Rejected,
}

impl ApprovalState {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalState::Approved => "approved",
            ApprovalState::Rejected => "rejected",
        }
    }
}

/// A remediation workspace as served by the system of record. `version` is
/// the optimistic-lock token; `updated_at` is display ordering only and is
/// never consulted for conflict resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: i64,
    pub workspace_key: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub owner_id: i32,
    pub lifecycle_state: LifecycleState,
    #[serde(default)]
    pub active_revision_id: Option<i64>,
    #[serde(default)]
    pub lineage_tags: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceRevision {
    pub id: i64,
    pub workspace_id: i64,
    pub revision_number: i64,
    #[serde(default)]
    pub plan: Value,
    pub schema_status: String,
    pub policy_status: String,
    pub simulation_status: String,
    pub promotion_status: PromotionStatus,
    #[serde(default)]
    pub promoted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

/// Result of one promotion gate check, recorded against a revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateCheckSnapshot {
    pub id: i64,
    pub revision_id: i64,
    pub snapshot_type: String,
    pub status: String,
    #[serde(default)]
    pub gate_context: Value,
    #[serde(default)]
    pub notes: Vec<String>,
    pub recorded_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Manual-override provenance: who forced the run past its gates and why.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunOverride {
    pub actor: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionVerdict {
    pub allowed: bool,
    #[serde(default)]
    pub veto_reasons: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

/// Content-addressed reference to an artifact produced by a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactFingerprint {
    pub artifact_type: String,
    pub digest: String,
    #[serde(default)]
    pub uri: Option<String>,
}

/// One remediation/automation attempt against a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemediationRun {
    pub id: i64,
    pub workspace_id: i64,
    #[serde(default)]
    pub revision_id: Option<i64>,
    pub playbook: String,
    pub status: RunStatus,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub approval_state: Option<ApprovalState>,
    #[serde(default)]
    pub approval_decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approval_notes: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub retry_attempt: u32,
    #[serde(default)]
    pub retry_limit: u32,
    #[serde(default)]
    pub retry_ledger: Vec<RetryAttempt>,
    #[serde(default)]
    pub override_provenance: Option<RunOverride>,
    #[serde(default)]
    pub promotion_verdict: Option<PromotionVerdict>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactFingerprint>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Attestation posture of the runtime instance a run executed against.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrustState {
    #[serde(default)]
    pub attestation_status: String,
    #[serde(default)]
    pub lifecycle_state: String,
    #[serde(default)]
    pub remediation_state: Option<String>,
    #[serde(default)]
    pub remediation_attempts: i32,
    #[serde(default)]
    pub freshness_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IntelligenceScore {
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub last_observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MarketplaceReadiness {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub last_completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_state_round_trips_through_str() {
        for state in [
            LifecycleState::Draft,
            LifecycleState::Active,
            LifecycleState::Suspended,
            LifecycleState::Retired,
        ] {
            assert_eq!(LifecycleState::parse(state.as_str()), Some(state));
        }
        assert_eq!(LifecycleState::parse("archived"), None);
    }

    #[test]
    fn run_deserializes_with_optional_fields_absent() {
        let run: RemediationRun = serde_json::from_str(
            r#"{
                "id": 7,
                "workspace_id": 1,
                "playbook": "rotate-keys",
                "status": "pending",
                "started_at": "2026-03-01T10:00:00Z",
                "version": 3,
                "updated_at": "2026-03-01T10:00:00Z"
            }"#,
        )
        .expect("parse minimal run");
        assert_eq!(run.retry_attempt, 0);
        assert!(run.retry_ledger.is_empty());
        assert!(run.approval_state.is_none());
        assert!(run.artifacts.is_empty());
    }
}
