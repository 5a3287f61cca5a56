//! In-memory reconciliation store.
//!
//! Both sources of truth converge here: full snapshots from the pager and
//! field-wise deltas from the stream. Acceptance is version-gated per record
//! so a late page never rolls back a fresher stream update, and vice versa.
//! Removal is explicit (`removed: true` on a delta); absence from a later
//! page never destroys a workspace.

use std::cell::RefCell;
use std::collections::HashMap;

use tracing::{debug, warn};

use flightdeck_core::merge::{
    self, apply_posture_changes, merge_run_delta, run_snapshot_from_delta, version_accepts,
    MergeOutcome,
};
use flightdeck_core::{LifecyclePage, RunDelta, WorkspaceDelta, WorkspaceSnapshot};

#[derive(Debug, Default)]
pub struct ReconciliationStore {
    workspaces: HashMap<i64, WorkspaceSnapshot>,
    /// Last delta seen per run id, kept so presentation can highlight
    /// freshly changed runs. Cleared on removal or when an action targets
    /// the run.
    pending_run_deltas: HashMap<i64, RunDelta>,
    /// Run deltas that arrived before their workspace. Replayed when the
    /// workspace shows up through the pager.
    parked_run_deltas: HashMap<i64, Vec<RunDelta>>,
    cursor: Option<i64>,
    /// Display order, invalidated on every mutation and rebuilt lazily.
    ordering: RefCell<Option<Vec<i64>>>,
}

/// What one page application did, for logging and for the pager to decide
/// whether more pages remain. `next_cursor` is the page's declared
/// continuation, distinct from the retained cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOutcome {
    pub applied: usize,
    pub skipped_stale: usize,
    pub next_cursor: Option<i64>,
}

impl ReconciliationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }

    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: Option<i64>) {
        self.cursor = cursor;
    }

    pub fn get(&self, workspace_id: i64) -> Option<&WorkspaceSnapshot> {
        self.workspaces.get(&workspace_id)
    }

    pub fn get_mut(&mut self, workspace_id: i64) -> Option<&mut WorkspaceSnapshot> {
        self.ordering.borrow_mut().take();
        self.workspaces.get_mut(&workspace_id)
    }

    /// Replace a workspace wholesale, bypassing the version gate. Reserved
    /// for rollback of a speculative local apply, where the baseline is by
    /// construction the last server-confirmed state.
    pub fn restore(&mut self, snapshot: WorkspaceSnapshot) {
        self.ordering.borrow_mut().take();
        self.workspaces.insert(snapshot.workspace.id, snapshot);
    }

    pub fn remove(&mut self, workspace_id: i64) -> Option<WorkspaceSnapshot> {
        self.ordering.borrow_mut().take();
        self.parked_run_deltas.remove(&workspace_id);
        let removed = self.workspaces.remove(&workspace_id);
        if let Some(snapshot) = &removed {
            for entry in &snapshot.recent_runs {
                self.pending_run_deltas.remove(&entry.run.id);
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.ordering.borrow_mut().take();
        self.workspaces.clear();
        self.pending_run_deltas.clear();
        self.parked_run_deltas.clear();
        self.cursor = None;
    }

    /// Last unfolded delta for a run, if presentation should highlight it
    /// as freshly changed.
    pub fn pending_run_delta(&self, run_id: i64) -> Option<&RunDelta> {
        self.pending_run_deltas.get(&run_id)
    }

    /// Drop the freshly-changed marker for a run. Called when an action
    /// targets the run: the optimistic state is presumed fresher than any
    /// pending delta annotation.
    pub fn clear_pending_run_delta(&mut self, run_id: i64) {
        self.pending_run_deltas.remove(&run_id);
    }

    /// Workspace ids in display order: most recently updated first, id
    /// descending as the tiebreak.
    pub fn ordered_ids(&self) -> Vec<i64> {
        if let Some(cached) = self.ordering.borrow().as_ref() {
            return cached.clone();
        }
        let mut ids: Vec<i64> = self.workspaces.keys().copied().collect();
        ids.sort_by(|a, b| {
            let left = &self.workspaces[a].workspace;
            let right = &self.workspaces[b].workspace;
            right
                .updated_at
                .cmp(&left.updated_at)
                .then(right.id.cmp(&left.id))
        });
        *self.ordering.borrow_mut() = Some(ids.clone());
        ids
    }

    pub fn ordered_snapshots(&self) -> Vec<WorkspaceSnapshot> {
        self.ordered_ids()
            .into_iter()
            .filter_map(|id| self.workspaces.get(&id).cloned())
            .collect()
    }

    /// Seed the store from a cache load. Cache entries are treated like a
    /// page: version-gated, so a stale cache never overwrites live data.
    pub fn seed(&mut self, snapshots: Vec<WorkspaceSnapshot>, cursor: Option<i64>) {
        for snapshot in snapshots {
            self.upsert_snapshot(snapshot);
        }
        if self.cursor.is_none() {
            self.cursor = cursor;
        }
    }

    /// Apply one page from the pager. The retained cursor advances to the
    /// last element's identity, or to the declared `next_cursor` when the
    /// page carried no rows (an empty page with a declared cursor means
    /// "continue paging, nothing new here").
    pub fn apply_page(&mut self, page: LifecyclePage) -> PageOutcome {
        let mut applied = 0usize;
        let mut skipped_stale = 0usize;

        let declared = page.next_cursor;
        let last_id = page.workspaces.last().map(|snapshot| snapshot.workspace.id);
        for snapshot in page.workspaces {
            if self.upsert_snapshot(snapshot) {
                applied += 1;
            } else {
                skipped_stale += 1;
            }
        }

        if let Some(cursor) = last_id.or(declared) {
            self.cursor = Some(cursor);
        }

        debug!(applied, skipped_stale, next_cursor = ?declared, "page reconciled");
        PageOutcome {
            applied,
            skipped_stale,
            next_cursor: declared,
        }
    }

    /// Apply one stream delta envelope. Per-workspace version gate, then
    /// field-wise merge of runs, gates, and postures.
    pub fn apply_delta(&mut self, delta: &WorkspaceDelta) {
        self.ordering.borrow_mut().take();

        if delta.removed {
            if self.remove(delta.workspace_id).is_some() {
                debug!(workspace_id = delta.workspace_id, "workspace removed by stream");
            }
            return;
        }

        let Some(snapshot) = self.workspaces.get_mut(&delta.workspace_id) else {
            // The workspace itself cannot be materialized from a partial
            // patch; keep only its run deltas for replay after the pager
            // delivers it.
            if !delta.run_upserts.is_empty() {
                self.parked_run_deltas
                    .entry(delta.workspace_id)
                    .or_default()
                    .extend(delta.run_upserts.iter().cloned());
            }
            warn!(
                workspace_id = delta.workspace_id,
                "delta for unknown workspace, run patches parked"
            );
            return;
        };

        if let Some(version) = delta.version {
            if !version_accepts(snapshot.workspace.version, version) {
                debug!(
                    workspace_id = delta.workspace_id,
                    stored = snapshot.workspace.version,
                    incoming = version,
                    "stale workspace delta skipped"
                );
                return;
            }
            snapshot.workspace.version = version;
        }

        if let Some(state) = delta.lifecycle_state {
            snapshot.workspace.lifecycle_state = state;
        }
        if let Some(updated_at) = delta.updated_at {
            snapshot.workspace.updated_at = updated_at;
        }
        if let Some(revision) = &delta.active_revision {
            snapshot.workspace.active_revision_id = Some(revision.revision.id);
            snapshot.active_revision = Some(revision.clone());
        }

        for run_delta in &delta.run_upserts {
            apply_run_delta(snapshot, run_delta);
            self.pending_run_deltas
                .insert(run_delta.run_id, run_delta.clone());
        }
        for run_id in &delta.removed_run_ids {
            snapshot.recent_runs.retain(|entry| entry.run.id != *run_id);
            self.pending_run_deltas.remove(run_id);
        }

        if let Some(revision) = &mut snapshot.active_revision {
            for gate in &delta.gate_upserts {
                if gate.revision_id != revision.revision.id {
                    continue;
                }
                match revision
                    .gate_snapshots
                    .iter_mut()
                    .find(|existing| existing.id == gate.id)
                {
                    Some(existing) => {
                        if version_accepts(existing.version, gate.version) {
                            *existing = gate.clone();
                        }
                    }
                    None => revision.gate_snapshots.push(gate.clone()),
                }
            }
            for gate_id in &delta.removed_gate_ids {
                revision.gate_snapshots.retain(|gate| gate.id != *gate_id);
            }
        }

        apply_posture_changes(&mut snapshot.promotion_postures, &delta.posture_changes);
        for track in &delta.removed_postures {
            snapshot.promotion_postures.remove(track);
        }
    }

    /// Version-gated whole-snapshot upsert. Returns whether the incoming
    /// snapshot was accepted.
    fn upsert_snapshot(&mut self, snapshot: WorkspaceSnapshot) -> bool {
        self.ordering.borrow_mut().take();
        let workspace_id = snapshot.workspace.id;

        if let Some(existing) = self.workspaces.get(&workspace_id) {
            if !version_accepts(existing.workspace.version, snapshot.workspace.version) {
                return false;
            }
        }
        self.workspaces.insert(workspace_id, snapshot);

        if let Some(parked) = self.parked_run_deltas.remove(&workspace_id) {
            if let Some(snapshot) = self.workspaces.get_mut(&workspace_id) {
                for run_delta in &parked {
                    apply_run_delta(snapshot, run_delta);
                    self.pending_run_deltas
                        .insert(run_delta.run_id, run_delta.clone());
                }
            }
        }
        true
    }
}

/// Merge one run delta into a workspace snapshot, materializing the run if
/// it is new. An incomplete delta for an unknown run is dropped with a
/// warning; the next full page supplies the run anyway.
fn apply_run_delta(snapshot: &mut WorkspaceSnapshot, run_delta: &RunDelta) {
    match snapshot.run_mut(run_delta.run_id) {
        Some(existing) => match merge_run_delta(existing, run_delta) {
            Ok(MergeOutcome::Applied) => {}
            Ok(MergeOutcome::Stale) => {
                debug!(run_id = run_delta.run_id, "stale run delta skipped");
            }
            Err(err) => {
                warn!(run_id = run_delta.run_id, error = %err, "run delta rejected");
            }
        },
        None => match run_snapshot_from_delta(snapshot.workspace.id, run_delta) {
            Ok(new_run) => snapshot.recent_runs.push(new_run),
            Err(merge::MergeError::IncompleteRun { run_id, missing }) => {
                warn!(run_id, missing, "incomplete delta for unknown run dropped");
            }
            Err(err) => {
                warn!(run_id = run_delta.run_id, error = %err, "run delta rejected");
            }
        },
    }
}
