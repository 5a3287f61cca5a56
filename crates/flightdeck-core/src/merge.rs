//! Field-wise delta merge rules.
//!
//! The delta feed is bandwidth-optimized: it only ships changed sub-fields,
//! so merging must be field-wise. A whole-object replace would erase fields
//! the server considered unchanged and therefore omitted. Applying the same
//! delta twice must land on the same state as applying it once.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::wire::{FieldChange, RunDelta, RunSnapshot};

#[derive(Debug, Clone, Error)]
pub enum MergeError {
    #[error("run delta for {run_id} cannot materialize a new run: missing {missing}")]
    IncompleteRun { run_id: i64, missing: &'static str },
    #[error("field change on '{field}' rejected: {detail}")]
    FieldChange { field: String, detail: String },
}

/// Whether a merge was applied or skipped as stale. Stale is not an error:
/// out-of-order resends across a reconnect are expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    Stale,
}

/// Accept an incoming record only when its version token is at least the
/// stored one. Equal versions are accepted so a re-sent record is idempotent.
pub fn version_accepts(stored: i64, incoming: i64) -> bool {
    incoming >= stored
}

/// Merge a partial run document into a stored run snapshot. Only fields
/// present in the delta are replaced; absence means unchanged.
pub fn merge_run_delta(target: &mut RunSnapshot, delta: &RunDelta) -> Result<MergeOutcome, MergeError> {
    if let Some(version) = delta.version {
        if !version_accepts(target.run.version, version) {
            return Ok(MergeOutcome::Stale);
        }
        target.run.version = version;
    }

    let run = &mut target.run;
    if let Some(playbook) = &delta.playbook {
        run.playbook = playbook.clone();
    }
    if let Some(revision_id) = delta.revision_id {
        run.revision_id = Some(revision_id);
    }
    if let Some(approval_required) = delta.approval_required {
        run.approval_required = approval_required;
    }
    if let Some(started_at) = delta.started_at {
        run.started_at = started_at;
    }
    if let Some(status) = delta.status {
        run.status = status;
    }
    if let Some(state) = delta.approval_state {
        run.approval_state = Some(state);
    }
    if let Some(decided_at) = delta.approval_decided_at {
        run.approval_decided_at = Some(decided_at);
    }
    if let Some(notes) = &delta.approval_notes {
        run.approval_notes = Some(notes.clone());
    }
    if let Some(completed_at) = delta.completed_at {
        run.completed_at = Some(completed_at);
    }
    if let Some(last_error) = &delta.last_error {
        run.last_error = Some(last_error.clone());
    }
    if let Some(failure_reason) = &delta.failure_reason {
        run.failure_reason = Some(failure_reason.clone());
    }
    if let Some(retry_attempt) = delta.retry_attempt {
        run.retry_attempt = retry_attempt;
    }
    if let Some(retry_limit) = delta.retry_limit {
        run.retry_limit = retry_limit;
    }
    if let Some(ledger) = &delta.retry_ledger {
        run.retry_ledger = ledger.clone();
    }
    if let Some(override_provenance) = &delta.override_provenance {
        run.override_provenance = Some(override_provenance.clone());
    }
    if let Some(verdict) = &delta.promotion_verdict {
        run.promotion_verdict = Some(verdict.clone());
    }
    if let Some(artifacts) = &delta.artifacts {
        run.artifacts = artifacts.clone();
    }
    if let Some(updated_at) = delta.updated_at {
        run.updated_at = updated_at;
    }

    apply_object_changes(&mut target.trust, &delta.trust_changes)?;
    apply_keyed_changes(&mut target.intelligence, &delta.intelligence_changes)?;
    apply_object_changes(&mut target.marketplace, &delta.marketplace_changes)?;

    Ok(MergeOutcome::Applied)
}

/// Materialize a brand-new run snapshot from a delta. The feed must supply
/// the non-defaultable fields for an added run; a delta that cannot stand on
/// its own is rejected and the caller drops it.
pub fn run_snapshot_from_delta(
    workspace_id: i64,
    delta: &RunDelta,
) -> Result<RunSnapshot, MergeError> {
    let playbook = delta.playbook.clone().ok_or(MergeError::IncompleteRun {
        run_id: delta.run_id,
        missing: "playbook",
    })?;
    let status = delta.status.ok_or(MergeError::IncompleteRun {
        run_id: delta.run_id,
        missing: "status",
    })?;
    let started_at = delta.started_at.ok_or(MergeError::IncompleteRun {
        run_id: delta.run_id,
        missing: "started_at",
    })?;
    let version = delta.version.ok_or(MergeError::IncompleteRun {
        run_id: delta.run_id,
        missing: "version",
    })?;

    let mut snapshot = RunSnapshot {
        run: crate::model::RemediationRun {
            id: delta.run_id,
            workspace_id,
            revision_id: delta.revision_id,
            playbook,
            status,
            approval_required: delta.approval_required.unwrap_or(false),
            approval_state: delta.approval_state,
            approval_decided_at: delta.approval_decided_at,
            approval_notes: delta.approval_notes.clone(),
            started_at,
            completed_at: delta.completed_at,
            last_error: delta.last_error.clone(),
            failure_reason: delta.failure_reason.clone(),
            retry_attempt: delta.retry_attempt.unwrap_or(0),
            retry_limit: delta.retry_limit.unwrap_or(0),
            retry_ledger: delta.retry_ledger.clone().unwrap_or_default(),
            override_provenance: delta.override_provenance.clone(),
            promotion_verdict: delta.promotion_verdict.clone(),
            artifacts: delta.artifacts.clone().unwrap_or_default(),
            version,
            updated_at: delta.updated_at.unwrap_or(started_at),
        },
        trust: None,
        intelligence: BTreeMap::new(),
        marketplace: None,
    };

    apply_object_changes(&mut snapshot.trust, &delta.trust_changes)?;
    apply_keyed_changes(&mut snapshot.intelligence, &delta.intelligence_changes)?;
    apply_object_changes(&mut snapshot.marketplace, &delta.marketplace_changes)?;

    Ok(snapshot)
}

/// Apply field-level changes to a typed sub-object by round-tripping it
/// through a JSON map. A missing target starts from defaults; `current:
/// None` on a struct field is ignored (struct fields are not removable).
pub fn apply_object_changes<T>(
    target: &mut Option<T>,
    changes: &[FieldChange],
) -> Result<(), MergeError>
where
    T: Serialize + DeserializeOwned + Default,
{
    if changes.is_empty() {
        return Ok(());
    }

    let base = target.take().unwrap_or_default();
    let mut object = match serde_json::to_value(&base) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            *target = Some(base);
            return Err(MergeError::FieldChange {
                field: changes[0].field.clone(),
                detail: format!("sub-object is not a JSON object: {other}"),
            });
        }
        Err(err) => {
            *target = Some(base);
            return Err(MergeError::FieldChange {
                field: changes[0].field.clone(),
                detail: err.to_string(),
            });
        }
    };

    for change in changes {
        match &change.current {
            Some(value) => {
                object.insert(change.field.clone(), value.clone());
            }
            None => {}
        }
    }

    match serde_json::from_value(Value::Object(object)) {
        Ok(updated) => {
            *target = Some(updated);
            Ok(())
        }
        Err(err) => {
            *target = Some(base);
            Err(MergeError::FieldChange {
                field: changes[0].field.clone(),
                detail: err.to_string(),
            })
        }
    }
}

/// Apply field-level changes to a capability-keyed map. Here `field` is the
/// key and `current: None` removes the entry.
pub fn apply_keyed_changes<V>(
    map: &mut BTreeMap<String, V>,
    changes: &[FieldChange],
) -> Result<(), MergeError>
where
    V: DeserializeOwned,
{
    for change in changes {
        match &change.current {
            Some(value) => {
                let parsed = serde_json::from_value(value.clone()).map_err(|err| {
                    MergeError::FieldChange {
                        field: change.field.clone(),
                        detail: err.to_string(),
                    }
                })?;
                map.insert(change.field.clone(), parsed);
            }
            None => {
                map.remove(&change.field);
            }
        }
    }
    Ok(())
}

/// Apply posture changes to the per-track map. Postures are loose JSON
/// documents; removal goes through `removed_postures`, but a `current: None`
/// change is honored as removal too.
pub fn apply_posture_changes(map: &mut BTreeMap<String, Value>, changes: &[FieldChange]) {
    for change in changes {
        match &change.current {
            Some(value) => {
                map.insert(change.field.clone(), value.clone());
            }
            None => {
                map.remove(&change.field);
            }
        }
    }
}
