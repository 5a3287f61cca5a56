//! Console session: the driver that ties the pager, stream, store, cache,
//! and action executor together.
//!
//! Startup is cache-then-revalidate: cached snapshots render immediately,
//! then a full repage replaces anything stale (the version gate makes the
//! order safe either way). After that the stream carries deltas, with
//! fallback polling covering any degraded stretch.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

use flightdeck_cache::ConsoleCache;
use flightdeck_core::{
    ApprovalState, ConsoleEventEnvelope, ConsoleEventType, ConsoleFilters, PromotionStatus,
};
use thiserror::Error;

use crate::actions::{ActionError, ActionExecutor};
use crate::api::{ApiError, LifecycleApi, PageRequest, StreamRequest, StreamSignal};
use crate::store::ReconciliationStore;
use crate::supervisor::{
    Directive, StreamEvent, StreamState, StreamSupervisor, FALLBACK_POLL_INTERVAL,
};

/// Upper bound on pages fetched in one revalidation sweep, so a backend
/// that keeps declaring cursors cannot spin the pager forever.
const MAX_PAGES_PER_SWEEP: usize = 50;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("initial load failed with nothing cached to show: {0}")]
    EmptyBootstrap(ApiError),
    #[error(transparent)]
    Action(#[from] ActionError),
}

/// Requests accepted by the running session loop. Mutation commands are
/// fire-and-forget; failures surface as [`SessionUpdate::ActionFailed`].
#[derive(Debug)]
pub enum SessionCommand {
    SetFilters(ConsoleFilters),
    TransitionPromotion {
        workspace_id: i64,
        new_status: PromotionStatus,
        notes: Vec<String>,
        gate_context: serde_json::Value,
    },
    DecideRunApproval {
        workspace_id: i64,
        run_id: i64,
        new_state: ApprovalState,
        approval_notes: Option<String>,
    },
    Shutdown,
}

/// Notifications pushed to the consumer (a UI, typically) whenever the
/// observable state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    StoreChanged,
    StreamStateChanged(StreamState),
    Banner(Option<String>),
    ActionFailed(String),
}

pub struct ConsoleSession {
    api: Arc<dyn LifecycleApi>,
    cache: Option<ConsoleCache>,
    store: ReconciliationStore,
    executor: ActionExecutor,
    supervisor: StreamSupervisor,
    filters: ConsoleFilters,
    stream_rx: Option<mpsc::Receiver<StreamSignal>>,
    fallback_timer: Option<Interval>,
    reconnect_at: Option<Instant>,
    banner: Option<String>,
    /// Server-side timestamp of the last envelope, for staleness display.
    last_event_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ConsoleSession {
    pub fn new(api: Arc<dyn LifecycleApi>, cache: Option<ConsoleCache>) -> Self {
        Self {
            executor: ActionExecutor::new(api.clone()),
            api,
            cache,
            store: ReconciliationStore::new(),
            supervisor: StreamSupervisor::new(),
            filters: ConsoleFilters::default(),
            stream_rx: None,
            fallback_timer: None,
            reconnect_at: None,
            banner: None,
            last_event_at: None,
        }
    }

    pub fn store(&self) -> &ReconciliationStore {
        &self.store
    }

    pub fn filters(&self) -> &ConsoleFilters {
        &self.filters
    }

    pub fn stream_state(&self) -> StreamState {
        self.supervisor.state()
    }

    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    pub fn last_event_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.last_event_at
    }

    /// Bring the session up: seed from cache, revalidate against the
    /// backend, then open the stream. Only a cold start with a failing
    /// backend is fatal; with cached data the session comes up degraded.
    pub async fn bootstrap(&mut self) -> Result<(), SessionError> {
        if let Some(cache) = &self.cache {
            match cache.load_filters() {
                Ok(Some(filters)) => self.filters = filters,
                Ok(None) => {}
                Err(err) => warn!(error = %err, "cached filters unavailable"),
            }
            let cursor = match cache.load_cursor() {
                Ok(cursor) => cursor,
                Err(err) => {
                    warn!(error = %err, "cached cursor unavailable");
                    None
                }
            };
            match cache.load_workspaces() {
                Ok(snapshots) => {
                    if !snapshots.is_empty() {
                        info!(count = snapshots.len(), "seeded from cache");
                    }
                    self.store.seed(snapshots, cursor);
                }
                Err(err) => warn!(error = %err, "cached workspaces unavailable"),
            }
        }

        if let Err(err) = self.revalidate().await {
            if self.store.is_empty() {
                return Err(SessionError::EmptyBootstrap(err));
            }
            warn!(error = %err, "revalidation failed, serving cached data");
            self.banner = Some(format!("showing cached data: {err}"));
        }
        self.mirror_to_cache();

        let directives = self.supervisor.handle(StreamEvent::StartRequested);
        self.execute(directives).await;
        Ok(())
    }

    /// Full filter reset: tear the stream down, drop every workspace and
    /// the cursor, persist the new filters, repage from the start, then
    /// bring a fresh stream up.
    pub async fn set_filters(&mut self, filters: ConsoleFilters) -> Result<(), SessionError> {
        info!("filter change, resetting session state");
        let directives = self.supervisor.handle(StreamEvent::CloseRequested);
        self.execute_sync(directives);
        self.supervisor = StreamSupervisor::new();
        self.reconnect_at = None;

        self.store.clear();
        self.filters = filters;
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.save_filters(&self.filters) {
                warn!(error = %err, "filter persist failed");
            }
            if let Err(err) = cache.save_cursor(None) {
                warn!(error = %err, "cursor reset persist failed");
            }
        }

        if let Err(err) = self.revalidate().await {
            warn!(error = %err, "repage after filter change failed");
            self.banner = Some(format!("reload failed: {err}"));
        }
        self.mirror_to_cache();

        let directives = self.supervisor.handle(StreamEvent::StartRequested);
        self.execute(directives).await;
        Ok(())
    }

    pub async fn transition_promotion(
        &mut self,
        workspace_id: i64,
        new_status: PromotionStatus,
        notes: Vec<String>,
        gate_context: serde_json::Value,
    ) -> Result<(), SessionError> {
        self.executor
            .transition_promotion(&mut self.store, workspace_id, new_status, notes, gate_context)
            .await?;
        self.mirror_to_cache();
        Ok(())
    }

    pub async fn decide_run_approval(
        &mut self,
        workspace_id: i64,
        run_id: i64,
        new_state: ApprovalState,
        approval_notes: Option<String>,
    ) -> Result<(), SessionError> {
        self.executor
            .decide_run_approval(&mut self.store, workspace_id, run_id, new_state, approval_notes)
            .await?;
        self.mirror_to_cache();
        Ok(())
    }

    /// Drive the session until `Shutdown` or the command channel closes.
    /// Returns the session so the caller can inspect or persist final state.
    pub async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SessionCommand>,
        update_tx: mpsc::Sender<SessionUpdate>,
    ) -> ConsoleSession {
        loop {
            let state_before = self.supervisor.state();
            let banner_before = self.banner.clone();

            tokio::select! {
                maybe_command = command_rx.recv() => {
                    match maybe_command {
                        Some(SessionCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command, &update_tx).await,
                    }
                }
                signal = next_signal(&mut self.stream_rx) => {
                    self.handle_signal(signal).await;
                    let _ = update_tx.send(SessionUpdate::StoreChanged).await;
                }
                _ = fallback_tick(&mut self.fallback_timer) => {
                    self.poll_fallback().await;
                    let _ = update_tx.send(SessionUpdate::StoreChanged).await;
                }
                _ = reconnect_wait(self.reconnect_at) => {
                    self.reconnect_at = None;
                    let directives = self.supervisor.handle(StreamEvent::ReconnectTimerFired);
                    self.execute(directives).await;
                }
            }

            if self.supervisor.state() != state_before {
                let _ = update_tx
                    .send(SessionUpdate::StreamStateChanged(self.supervisor.state()))
                    .await;
            }
            if self.banner != banner_before {
                let _ = update_tx.send(SessionUpdate::Banner(self.banner.clone())).await;
            }
        }

        self.teardown();
        self
    }

    async fn handle_command(
        &mut self,
        command: SessionCommand,
        update_tx: &mpsc::Sender<SessionUpdate>,
    ) {
        let result = match command {
            SessionCommand::SetFilters(filters) => self.set_filters(filters).await,
            SessionCommand::TransitionPromotion {
                workspace_id,
                new_status,
                notes,
                gate_context,
            } => {
                self.transition_promotion(workspace_id, new_status, notes, gate_context)
                    .await
            }
            SessionCommand::DecideRunApproval {
                workspace_id,
                run_id,
                new_state,
                approval_notes,
            } => {
                self.decide_run_approval(workspace_id, run_id, new_state, approval_notes)
                    .await
            }
            SessionCommand::Shutdown => Ok(()),
        };
        match result {
            Ok(()) => {
                let _ = update_tx.send(SessionUpdate::StoreChanged).await;
            }
            Err(err) => {
                let _ = update_tx
                    .send(SessionUpdate::ActionFailed(err.to_string()))
                    .await;
            }
        }
    }

    async fn handle_signal(&mut self, signal: Option<StreamSignal>) {
        match signal {
            Some(StreamSignal::Event(envelope)) => {
                if !self.supervisor.is_live() {
                    let directives = self.supervisor.handle(StreamEvent::FirstEventParsed);
                    self.execute_sync(directives);
                }
                self.apply_envelope(envelope);
            }
            Some(StreamSignal::Closed { detail }) => {
                self.stream_rx = None;
                let directives = self.supervisor.handle(StreamEvent::ConnectionLost { detail });
                self.execute(directives).await;
            }
            None => {
                self.stream_rx = None;
                let directives = self.supervisor.handle(StreamEvent::ConnectionLost {
                    detail: "stream channel closed".to_string(),
                });
                self.execute(directives).await;
            }
        }
    }

    fn apply_envelope(&mut self, envelope: ConsoleEventEnvelope) {
        self.last_event_at = Some(envelope.emitted_at);
        match envelope.event_type {
            ConsoleEventType::Snapshot => {
                if let Some(page) = envelope.page {
                    self.store.apply_page(page);
                }
                if let Some(delta) = envelope.delta {
                    for workspace_delta in &delta.workspaces {
                        self.store.apply_delta(workspace_delta);
                    }
                }
                if let Some(cursor) = envelope.cursor {
                    self.store.set_cursor(Some(cursor));
                }
                self.banner = None;
                self.mirror_to_cache();
            }
            ConsoleEventType::Heartbeat => {
                // Heartbeats echo the subscription's current cursor; only a
                // genuinely new value is adopted and persisted, so an idle
                // stream does not write the cache once per heartbeat.
                if let Some(cursor) = envelope.cursor {
                    if self.store.cursor() != Some(cursor) {
                        self.store.set_cursor(Some(cursor));
                        if let Some(cache) = &self.cache {
                            if let Err(err) = cache.save_cursor(Some(cursor)) {
                                warn!(error = %err, "cursor persist failed");
                            }
                        }
                    }
                }
                debug!(cursor = ?envelope.cursor, "heartbeat");
            }
            ConsoleEventType::Error => {
                let detail = envelope
                    .error
                    .unwrap_or_else(|| "backend reported an error".to_string());
                warn!(detail = %detail, "stream error event");
                self.banner = Some(detail);
            }
        }
    }

    /// Repage the filtered collection from the start. The store keeps what
    /// it has; the version gate decides per record. An empty page that
    /// declares a continuation cursor means "keep paging", not done.
    async fn revalidate(&mut self) -> Result<(), ApiError> {
        let mut cursor = None;
        for _ in 0..MAX_PAGES_PER_SWEEP {
            let request = PageRequest::new(self.filters.clone(), cursor);
            let limit = request.limit as usize;
            let page = self.api.fetch_page(&request).await?;
            let outcome = self.store.apply_page(page);
            let rows = outcome.applied + outcome.skipped_stale;
            if outcome.next_cursor.is_none() && rows < limit {
                break;
            }
            cursor = outcome.next_cursor.or(self.store.cursor());
        }
        self.banner = None;
        Ok(())
    }

    /// One fallback poll while degraded: re-invoke the pager from the last
    /// known cursor and let the version gate reconcile whatever comes back.
    /// An empty page leaves the retained cursor where it was, so the
    /// persisted resume point never moves backwards.
    async fn poll_fallback(&mut self) {
        let request = PageRequest::new(self.filters.clone(), self.store.cursor());
        match self.api.fetch_page(&request).await {
            Ok(page) => {
                self.store.apply_page(page);
                self.banner = None;
                self.mirror_to_cache();
            }
            Err(err) => {
                warn!(error = %err, "fallback poll failed");
            }
        }
    }

    /// Execute supervisor directives, feeding open results back through the
    /// machine until it settles.
    async fn execute(&mut self, directives: Vec<Directive>) {
        let mut queue = std::collections::VecDeque::from(directives);
        while let Some(directive) = queue.pop_front() {
            match directive {
                Directive::OpenStream => {
                    let request = StreamRequest {
                        filters: self.filters.clone(),
                        cursor: self.store.cursor(),
                    };
                    match self.api.open_stream(&request).await {
                        Ok(rx) => {
                            // Stay Connecting until the new connection
                            // actually delivers an event.
                            self.stream_rx = Some(rx);
                        }
                        Err(err) => {
                            let event = StreamEvent::OpenFailed {
                                detail: err.to_string(),
                            };
                            queue.extend(self.supervisor.handle(event));
                        }
                    }
                }
                other => self.apply_directive(other),
            }
        }
    }

    /// Directive execution for paths that must not touch the network.
    fn execute_sync(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                Directive::OpenStream => {
                    debug!("open directive ignored on synchronous path");
                }
                other => self.apply_directive(other),
            }
        }
    }

    fn apply_directive(&mut self, directive: Directive) {
        match directive {
            Directive::OpenStream => {}
            Directive::StartFallbackPolling => {
                if self.fallback_timer.is_none() {
                    self.fallback_timer = Some(tokio::time::interval(FALLBACK_POLL_INTERVAL));
                }
            }
            Directive::StopFallbackPolling => {
                self.fallback_timer = None;
            }
            Directive::ScheduleReconnect { after } => {
                self.reconnect_at = Some(Instant::now() + after);
            }
            Directive::ReleaseConnection => {
                self.stream_rx = None;
            }
        }
    }

    /// Ordered teardown: live stream first, then the fallback timer, then
    /// the reconnect timer, then one final cache mirror.
    fn teardown(&mut self) {
        let directives = self.supervisor.handle(StreamEvent::CloseRequested);
        self.execute_sync(directives);
        self.stream_rx = None;
        self.fallback_timer = None;
        self.reconnect_at = None;
        self.mirror_to_cache();
        info!("session closed");
    }

    /// Best-effort cache mirror; persistence failure never interrupts the
    /// live session.
    fn mirror_to_cache(&mut self) {
        let Some(cache) = &mut self.cache else {
            return;
        };
        let snapshots = self.store.ordered_snapshots();
        if let Err(err) = cache.save_workspaces(&snapshots) {
            warn!(error = %err, "workspace cache write failed");
        }
        if let Err(err) = cache.save_cursor(self.store.cursor()) {
            warn!(error = %err, "cursor cache write failed");
        }
    }
}

async fn next_signal(rx: &mut Option<mpsc::Receiver<StreamSignal>>) -> Option<StreamSignal> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn fallback_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn reconnect_wait(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeApi, StreamScript};
    use chrono::{DateTime, TimeZone, Utc};
    use flightdeck_core::model::{LifecycleState, Workspace};
    use flightdeck_core::{
        ConsoleDelta, LifecyclePage, Severity, WorkspaceDelta, WorkspaceSnapshot,
    };
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn snapshot(id: i64, minute: u32, version: i64) -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            workspace: Workspace {
                id,
                workspace_key: format!("ws-{id}"),
                display_name: format!("Workspace {id}"),
                description: None,
                owner_id: 1,
                lifecycle_state: LifecycleState::Active,
                active_revision_id: None,
                lineage_tags: Vec::new(),
                metadata: serde_json::Value::Null,
                created_at: ts(0),
                updated_at: ts(minute),
                version,
            },
            active_revision: None,
            recent_runs: Vec::new(),
            promotion_postures: BTreeMap::new(),
        }
    }

    fn page(workspaces: Vec<WorkspaceSnapshot>, next_cursor: Option<i64>) -> LifecyclePage {
        LifecyclePage {
            workspaces,
            next_cursor,
        }
    }

    fn envelope(event_type: ConsoleEventType) -> ConsoleEventEnvelope {
        ConsoleEventEnvelope {
            event_type,
            emitted_at: ts(5),
            cursor: None,
            page: None,
            delta: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn bootstrap_seeds_from_cache_then_revalidates() {
        let mut warm = flightdeck_cache::ConsoleCache::open_in_memory().expect("cache");
        warm.save_workspaces(&[snapshot(1, 1, 2)]).expect("seed cache");
        warm.save_cursor(Some(1)).expect("seed cursor");

        let api = Arc::new(FakeApi::new());
        // Backend serves a fresher version of workspace 1 plus a new one.
        api.push_page(page(vec![snapshot(1, 3, 5), snapshot(2, 2, 1)], None));

        let mut session = ConsoleSession::new(api.clone(), Some(warm));
        session.bootstrap().await.expect("bootstrap");

        assert_eq!(session.store().len(), 2);
        assert_eq!(session.store().get(1).expect("present").workspace.version, 5);
        // Revalidation starts from the beginning, not the cached cursor.
        assert_eq!(api.page_requests()[0].cursor, None);
        // The subscription is open but not yet trusted: no event seen.
        assert_eq!(session.stream_state(), StreamState::Connecting);
    }

    #[tokio::test]
    async fn cold_start_with_failing_backend_is_fatal() {
        struct FailingApi;
        #[async_trait::async_trait]
        impl LifecycleApi for FailingApi {
            async fn fetch_page(&self, _: &PageRequest) -> Result<LifecyclePage, ApiError> {
                Err(ApiError::Transport("refused".to_string()))
            }
            async fn open_stream(
                &self,
                _: &StreamRequest,
            ) -> Result<mpsc::Receiver<StreamSignal>, ApiError> {
                Err(ApiError::Transport("refused".to_string()))
            }
            async fn submit_promotion(
                &self,
                _: i64,
                _: i64,
                _: &flightdeck_core::PromotionTransitionRequest,
            ) -> Result<flightdeck_core::PromotionOutcome, ApiError> {
                Err(ApiError::Transport("refused".to_string()))
            }
            async fn submit_run_approval(
                &self,
                _: i64,
                _: &flightdeck_core::RunApprovalRequest,
            ) -> Result<flightdeck_core::RemediationRun, ApiError> {
                Err(ApiError::Transport("refused".to_string()))
            }
        }

        let mut session = ConsoleSession::new(Arc::new(FailingApi), None);
        let err = session.bootstrap().await.expect_err("cold start fails");
        assert!(matches!(err, SessionError::EmptyBootstrap(_)));
    }

    #[tokio::test]
    async fn set_filters_resets_store_cursor_and_stream() {
        let api = Arc::new(FakeApi::new());
        api.push_page(page(vec![snapshot(1, 1, 1), snapshot(2, 2, 1)], None));
        // Page served after the filter change.
        api.push_page(page(vec![snapshot(9, 4, 1)], None));

        let cache = flightdeck_cache::ConsoleCache::open_in_memory().expect("cache");
        let mut session = ConsoleSession::new(api.clone(), Some(cache));
        session.bootstrap().await.expect("bootstrap");
        assert_eq!(session.store().len(), 2);
        let streams_before = api.open_stream_count();

        let filters = ConsoleFilters::parse(Some("payments"), Some("active"), Some("high"))
            .expect("valid filters");
        session.set_filters(filters.clone()).await.expect("set filters");

        // Old rows are gone, only the new page remains.
        assert_eq!(session.store().ordered_ids(), vec![9]);
        // Repage started from a clean cursor with the new predicate.
        let requests = api.page_requests();
        let last = requests.last().expect("page request");
        assert_eq!(last.cursor, None);
        assert_eq!(last.filters, filters);
        // A fresh stream subscription carries the new filters too.
        assert_eq!(api.open_stream_count(), streams_before + 1);
        let stream_request = api.stream_requests().last().cloned().expect("stream request");
        assert_eq!(stream_request.filters.severity, Some(Severity::High));
        // The persisted filters follow suit.
        let cache = session.cache.as_ref().expect("cache");
        assert_eq!(cache.load_filters().expect("load"), Some(filters));
    }

    #[tokio::test]
    async fn snapshot_and_delta_envelopes_update_the_store() {
        let api = Arc::new(FakeApi::new());
        api.push_page(page(vec![snapshot(1, 1, 1)], None));

        let mut session = ConsoleSession::new(api, None);
        session.bootstrap().await.expect("bootstrap");

        let mut delta_envelope = envelope(ConsoleEventType::Snapshot);
        let mut workspace_delta = WorkspaceDelta::new(1);
        workspace_delta.lifecycle_state = Some(LifecycleState::Suspended);
        workspace_delta.version = Some(2);
        delta_envelope.delta = Some(ConsoleDelta {
            workspaces: vec![workspace_delta],
        });
        delta_envelope.cursor = Some(17);
        session.apply_envelope(delta_envelope);

        let stored = session.store().get(1).expect("present");
        assert_eq!(stored.workspace.lifecycle_state, LifecycleState::Suspended);
        assert_eq!(session.store().cursor(), Some(17));

        let mut heartbeat = envelope(ConsoleEventType::Heartbeat);
        heartbeat.cursor = Some(21);
        session.apply_envelope(heartbeat);
        assert_eq!(session.store().cursor(), Some(21));

        let mut error_event = envelope(ConsoleEventType::Error);
        error_event.error = Some("shard rebalancing".to_string());
        session.apply_envelope(error_event);
        assert_eq!(session.banner(), Some("shard rebalancing"));
    }

    #[tokio::test]
    async fn heartbeat_updates_last_seen_and_persists_only_a_new_cursor() {
        let api = Arc::new(FakeApi::new());
        api.push_page(page(vec![snapshot(1, 1, 1)], None));

        let cache = flightdeck_cache::ConsoleCache::open_in_memory().expect("cache");
        let mut session = ConsoleSession::new(api, Some(cache));
        session.bootstrap().await.expect("bootstrap");
        assert_eq!(session.store().cursor(), Some(1));

        let mut advance = envelope(ConsoleEventType::Heartbeat);
        advance.cursor = Some(9);
        session.apply_envelope(advance);
        assert_eq!(session.last_event_at(), Some(ts(5)));
        assert_eq!(session.store().cursor(), Some(9));
        let cache = session.cache.as_ref().expect("cache");
        assert_eq!(cache.load_cursor().expect("load"), Some(9));

        // An echo of the cursor the session already holds changes nothing.
        let mut echo = envelope(ConsoleEventType::Heartbeat);
        echo.cursor = Some(9);
        session.apply_envelope(echo);
        assert_eq!(session.store().cursor(), Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_session_polls_on_fallback_interval_and_reconnects() {
        let api = Arc::new(FakeApi::new());
        api.fail_streams_by_default();
        api.push_page(page(vec![snapshot(1, 1, 1)], None));

        let mut session = ConsoleSession::new(api.clone(), None);
        session.bootstrap().await.expect("bootstrap");
        assert_eq!(session.stream_state(), StreamState::Degraded);
        let pages_after_bootstrap = api.page_request_count();
        let streams_after_bootstrap = api.open_stream_count();

        let (command_tx, command_rx) = mpsc::channel(4);
        let (update_tx, mut update_rx) = mpsc::channel(64);
        let handle = tokio::spawn(session.run(command_rx, update_tx));

        // Paused time auto-advances while the loop is idle: reconnect
        // attempts (all failing) and fallback polls both accumulate.
        tokio::time::sleep(Duration::from_secs(30)).await;
        command_tx
            .send(SessionCommand::Shutdown)
            .await
            .expect("send shutdown");
        let session = handle.await.expect("loop exits");

        // ~6 fallback polls in 30s at the 5s interval.
        assert!(api.page_request_count() >= pages_after_bootstrap + 4);
        // Reconnects kept firing on backoff (1+2+4+8+10 < 30s).
        assert!(api.open_stream_count() >= streams_after_bootstrap + 4);
        // Shutdown tears the supervisor down to its terminal state.
        assert_eq!(session.stream_state(), StreamState::Closed);

        // The loop reported its activity, and never claimed a live stream.
        let mut saw_store_change = false;
        while let Ok(update) = update_rx.try_recv() {
            assert_ne!(update, SessionUpdate::StreamStateChanged(StreamState::Connected));
            if update == SessionUpdate::StoreChanged {
                saw_store_change = true;
            }
        }
        assert!(saw_store_change);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_poll_resumes_from_the_last_known_cursor() {
        let api = Arc::new(FakeApi::new());
        api.fail_streams_by_default();
        api.push_page(page(vec![snapshot(40, 1, 1)], None));

        let mut session = ConsoleSession::new(api.clone(), None);
        session.bootstrap().await.expect("bootstrap");
        assert_eq!(session.store().cursor(), Some(40));
        assert_eq!(session.stream_state(), StreamState::Degraded);

        let (command_tx, command_rx) = mpsc::channel(4);
        let (update_tx, _update_rx) = mpsc::channel(64);
        let handle = tokio::spawn(session.run(command_rx, update_tx));

        // At least one fallback tick fires in the window.
        tokio::time::sleep(Duration::from_secs(6)).await;
        command_tx
            .send(SessionCommand::Shutdown)
            .await
            .expect("send shutdown");
        let session = handle.await.expect("loop exits");

        // The poll carried the last known cursor, not a first-page request.
        let poll = api.page_requests().last().cloned().expect("fallback poll issued");
        assert_eq!(poll.cursor, Some(40));
        // Nothing new came back, so the resume point did not move.
        assert_eq!(session.store().cursor(), Some(40));
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_stream_stops_fallback_polling() {
        let api = Arc::new(FakeApi::new());
        api.push_page(page(vec![snapshot(1, 1, 1)], None));
        // First subscription fails; the retry succeeds, delivers a
        // heartbeat, and stays open.
        api.script_stream(StreamScript::Fail {
            detail: "refused".to_string(),
        });
        let mut heartbeat = envelope(ConsoleEventType::Heartbeat);
        heartbeat.cursor = Some(7);
        api.script_stream(StreamScript::Open {
            envelopes: vec![heartbeat],
            close: None,
        });

        let mut session = ConsoleSession::new(api.clone(), None);
        session.bootstrap().await.expect("bootstrap");
        assert_eq!(session.stream_state(), StreamState::Degraded);

        let (command_tx, command_rx) = mpsc::channel(4);
        let (update_tx, mut update_rx) = mpsc::channel(64);
        let handle = tokio::spawn(session.run(command_rx, update_tx));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let polls_at_recovery = api.page_request_count();
        // Once connected, fallback polling stops: no further page fetches.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.page_request_count(), polls_at_recovery);

        command_tx
            .send(SessionCommand::Shutdown)
            .await
            .expect("send shutdown");
        let session = handle.await.expect("loop exits");
        assert_eq!(session.stream_state(), StreamState::Closed);

        let mut saw_connected = false;
        while let Ok(update) = update_rx.try_recv() {
            if update == SessionUpdate::StreamStateChanged(StreamState::Connected) {
                saw_connected = true;
            }
        }
        assert!(saw_connected);
    }

    #[tokio::test]
    async fn stream_delivered_deltas_flow_through_the_run_loop() {
        let api = Arc::new(FakeApi::new());
        api.push_page(page(vec![snapshot(1, 1, 1)], None));

        let mut workspace_delta = WorkspaceDelta::new(1);
        workspace_delta.lifecycle_state = Some(LifecycleState::Retired);
        workspace_delta.version = Some(4);
        let mut event = envelope(ConsoleEventType::Snapshot);
        event.delta = Some(ConsoleDelta {
            workspaces: vec![workspace_delta],
        });
        api.script_stream(StreamScript::Open {
            envelopes: vec![event],
            close: None,
        });

        let mut session = ConsoleSession::new(api, None);
        session.bootstrap().await.expect("bootstrap");

        let (command_tx, command_rx) = mpsc::channel(4);
        let (update_tx, mut update_rx) = mpsc::channel(16);
        let handle = tokio::spawn(session.run(command_rx, update_tx));

        // Wait for the loop to report the store change from the delta.
        let update = update_rx.recv().await.expect("update");
        assert_eq!(update, SessionUpdate::StoreChanged);

        command_tx
            .send(SessionCommand::Shutdown)
            .await
            .expect("send shutdown");
        let session = handle.await.expect("loop exits");
        assert_eq!(
            session.store().get(1).expect("present").workspace.lifecycle_state,
            LifecycleState::Retired
        );
        assert_eq!(session.store().get(1).expect("present").workspace.version, 4);
    }
}
