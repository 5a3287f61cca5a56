//! Optimistic action executor.
//!
//! Mutations apply speculatively to the local store before the backend
//! confirms. The baseline snapshot captured before the first speculative
//! apply is what rollback restores, and overlapping actions against the
//! same target reuse that ORIGINAL baseline so a second action can never
//! adopt the first one's unconfirmed state as "clean".

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use flightdeck_core::{
    ApprovalState, PromotionStatus, PromotionTransitionRequest, RunApprovalRequest,
    WorkspaceSnapshot,
};

use crate::api::{ApiError, LifecycleApi};
use crate::store::ReconciliationStore;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("workspace {0} not loaded")]
    UnknownWorkspace(i64),
    #[error("workspace {workspace_id} has no active revision")]
    NoActiveRevision { workspace_id: i64 },
    #[error("run {run_id} not found in workspace {workspace_id}")]
    UnknownRun { workspace_id: i64, run_id: i64 },
    /// The backend rejected the expected-version tokens. The local state has
    /// already been rolled back to the pre-action baseline; `detail` is the
    /// server's conflict body, verbatim.
    #[error("version conflict: {detail}")]
    Conflict { detail: String },
    #[error(transparent)]
    Api(ApiError),
}

pub struct ActionExecutor {
    api: Arc<dyn LifecycleApi>,
    /// Baseline snapshots keyed by workspace, captured before the first
    /// speculative apply and held until every action on that workspace
    /// settles.
    baselines: HashMap<i64, WorkspaceSnapshot>,
    in_flight: HashMap<i64, usize>,
}

impl ActionExecutor {
    pub fn new(api: Arc<dyn LifecycleApi>) -> Self {
        Self {
            api,
            baselines: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn has_pending(&self, workspace_id: i64) -> bool {
        self.in_flight.get(&workspace_id).copied().unwrap_or(0) > 0
    }

    /// Request a promotion status transition for the workspace's active
    /// revision: speculative local apply, authoritative submit, then either
    /// confirmation from the server record or rollback to the baseline.
    pub async fn transition_promotion(
        &mut self,
        store: &mut ReconciliationStore,
        workspace_id: i64,
        new_status: PromotionStatus,
        notes: Vec<String>,
        gate_context: serde_json::Value,
    ) -> Result<(), ActionError> {
        let snapshot = store
            .get(workspace_id)
            .ok_or(ActionError::UnknownWorkspace(workspace_id))?;
        let revision = snapshot
            .active_revision
            .as_ref()
            .ok_or(ActionError::NoActiveRevision { workspace_id })?;

        let request = PromotionTransitionRequest {
            promotion_status: new_status,
            notes,
            gate_context,
            expected_workspace_version: snapshot.workspace.version,
            expected_revision_version: revision.revision.version,
        };
        let revision_id = revision.revision.id;

        self.begin(store, workspace_id)?;
        if let Some(live) = store.get_mut(workspace_id) {
            if let Some(active) = &mut live.active_revision {
                active.revision.promotion_status = new_status;
                active.revision.updated_at = Utc::now();
            }
        }

        let result = self
            .api
            .submit_promotion(workspace_id, revision_id, &request)
            .await;

        match result {
            Ok(outcome) => {
                self.settle(workspace_id);
                if let Some(live) = store.get_mut(workspace_id) {
                    live.workspace = outcome.workspace;
                    if let Some(active) = &mut live.active_revision {
                        if active.revision.id == outcome.revision.id {
                            active.revision = outcome.revision;
                        }
                    }
                }
                info!(workspace_id, status = new_status.as_str(), "promotion confirmed");
                Ok(())
            }
            Err(err) => {
                self.rollback(store, workspace_id);
                Err(classify(err, workspace_id))
            }
        }
    }

    /// Decide a pending approval on a run: approve or reject, optimistically.
    pub async fn decide_run_approval(
        &mut self,
        store: &mut ReconciliationStore,
        workspace_id: i64,
        run_id: i64,
        new_state: ApprovalState,
        approval_notes: Option<String>,
    ) -> Result<(), ActionError> {
        let snapshot = store
            .get(workspace_id)
            .ok_or(ActionError::UnknownWorkspace(workspace_id))?;
        let run = snapshot
            .run(run_id)
            .ok_or(ActionError::UnknownRun { workspace_id, run_id })?;

        let request = RunApprovalRequest {
            new_state,
            approval_notes: approval_notes.clone(),
            expected_version: run.run.version,
        };

        self.begin(store, workspace_id)?;
        // The optimistic state supersedes any freshly-changed marker.
        store.clear_pending_run_delta(run_id);
        if let Some(live) = store.get_mut(workspace_id) {
            if let Some(entry) = live.run_mut(run_id) {
                entry.run.approval_state = Some(new_state);
                entry.run.approval_decided_at = Some(Utc::now());
                entry.run.approval_notes = approval_notes;
            }
        }

        let result = self.api.submit_run_approval(run_id, &request).await;

        match result {
            Ok(confirmed) => {
                self.settle(workspace_id);
                if let Some(live) = store.get_mut(workspace_id) {
                    if let Some(entry) = live.run_mut(run_id) {
                        entry.run = confirmed;
                    }
                }
                info!(run_id, state = new_state.as_str(), "run approval confirmed");
                Ok(())
            }
            Err(err) => {
                self.rollback(store, workspace_id);
                Err(classify(err, workspace_id))
            }
        }
    }

    /// Capture the pre-action baseline, or reuse the one an overlapping
    /// action already captured. The first snapshot wins: it is the last
    /// server-confirmed state.
    fn begin(
        &mut self,
        store: &ReconciliationStore,
        workspace_id: i64,
    ) -> Result<(), ActionError> {
        let snapshot = store
            .get(workspace_id)
            .ok_or(ActionError::UnknownWorkspace(workspace_id))?;
        self.baselines
            .entry(workspace_id)
            .or_insert_with(|| snapshot.clone());
        *self.in_flight.entry(workspace_id).or_insert(0) += 1;
        Ok(())
    }

    /// Confirmation path: drop the baseline once no action against the
    /// workspace remains in flight.
    fn settle(&mut self, workspace_id: i64) {
        if let Some(count) = self.in_flight.get_mut(&workspace_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight.remove(&workspace_id);
                self.baselines.remove(&workspace_id);
            }
        }
    }

    /// Failure path: restore the original baseline exactly as captured.
    fn rollback(&mut self, store: &mut ReconciliationStore, workspace_id: i64) {
        if let Some(count) = self.in_flight.get_mut(&workspace_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight.remove(&workspace_id);
            }
        }
        let baseline = if self.has_pending(workspace_id) {
            // Overlapping action still in flight: restore but keep the
            // baseline for the survivor.
            self.baselines.get(&workspace_id).cloned()
        } else {
            self.baselines.remove(&workspace_id)
        };
        match baseline {
            Some(snapshot) => {
                warn!(workspace_id, "action failed, restoring pre-action state");
                store.restore(snapshot);
            }
            None => {
                warn!(workspace_id, "action failed with no baseline to restore");
            }
        }
    }
}

/// Conflict status codes are surfaced as [`ActionError::Conflict`] with the
/// server body verbatim; everything else passes through.
fn classify(err: ApiError, workspace_id: i64) -> ActionError {
    match err {
        ApiError::Status { status: 409, body } | ApiError::Status { status: 412, body } => {
            warn!(workspace_id, "optimistic update conflicted");
            ActionError::Conflict { detail: body }
        }
        other => ActionError::Api(other),
    }
}
