//! Scripted [`LifecycleApi`] double for engine tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use flightdeck_core::{
    ConsoleEventEnvelope, LifecyclePage, PromotionOutcome, PromotionTransitionRequest,
    RemediationRun, RunApprovalRequest,
};

use crate::api::{ApiError, LifecycleApi, PageRequest, StreamRequest, StreamSignal};

/// Outcome of a scripted mutation call.
pub enum MutationOutcome<T> {
    Ok(T),
    Status { status: u16, body: String },
}

/// One scripted stream subscription.
pub enum StreamScript {
    /// The open itself fails.
    Fail { detail: String },
    /// The open succeeds; the listed envelopes are delivered, then the
    /// channel either stays open or closes with the given detail.
    Open {
        envelopes: Vec<ConsoleEventEnvelope>,
        close: Option<String>,
    },
}

#[derive(Default)]
pub struct FakeApi {
    pages: Mutex<VecDeque<LifecyclePage>>,
    page_requests: Mutex<Vec<PageRequest>>,
    streams: Mutex<VecDeque<StreamScript>>,
    stream_requests: Mutex<Vec<StreamRequest>>,
    fail_streams_by_default: Mutex<bool>,
    /// Senders held open for `Open { close: None }` scripts so the channel
    /// does not close under the subscriber.
    held_senders: Mutex<Vec<mpsc::Sender<StreamSignal>>>,
    promotions: Mutex<VecDeque<MutationOutcome<PromotionOutcome>>>,
    promotion_requests: Mutex<Vec<PromotionTransitionRequest>>,
    run_approvals: Mutex<VecDeque<MutationOutcome<RemediationRun>>>,
    run_approval_requests: Mutex<Vec<RunApprovalRequest>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, page: LifecyclePage) {
        self.pages.lock().expect("lock").push_back(page);
    }

    pub fn page_requests(&self) -> Vec<PageRequest> {
        self.page_requests.lock().expect("lock").clone()
    }

    pub fn page_request_count(&self) -> usize {
        self.page_requests.lock().expect("lock").len()
    }

    pub fn script_stream(&self, script: StreamScript) {
        self.streams.lock().expect("lock").push_back(script);
    }

    pub fn fail_streams_by_default(&self) {
        *self.fail_streams_by_default.lock().expect("lock") = true;
    }

    pub fn stream_requests(&self) -> Vec<StreamRequest> {
        self.stream_requests.lock().expect("lock").clone()
    }

    pub fn open_stream_count(&self) -> usize {
        self.stream_requests.lock().expect("lock").len()
    }

    pub fn script_promotion(&self, outcome: MutationOutcome<PromotionOutcome>) {
        self.promotions.lock().expect("lock").push_back(outcome);
    }

    pub fn last_promotion_request(&self) -> Option<PromotionTransitionRequest> {
        self.promotion_requests.lock().expect("lock").last().cloned()
    }

    pub fn script_run_approval(&self, outcome: MutationOutcome<RemediationRun>) {
        self.run_approvals.lock().expect("lock").push_back(outcome);
    }

    pub fn last_run_approval_request(&self) -> Option<RunApprovalRequest> {
        self.run_approval_requests
            .lock()
            .expect("lock")
            .last()
            .cloned()
    }
}

#[async_trait]
impl LifecycleApi for FakeApi {
    async fn fetch_page(&self, request: &PageRequest) -> Result<LifecyclePage, ApiError> {
        self.page_requests.lock().expect("lock").push(request.clone());
        Ok(self
            .pages
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(LifecyclePage {
                workspaces: Vec::new(),
                next_cursor: None,
            }))
    }

    async fn open_stream(
        &self,
        request: &StreamRequest,
    ) -> Result<mpsc::Receiver<StreamSignal>, ApiError> {
        self.stream_requests
            .lock()
            .expect("lock")
            .push(request.clone());

        let script = self.streams.lock().expect("lock").pop_front();
        let script = match script {
            Some(script) => script,
            None => {
                if *self.fail_streams_by_default.lock().expect("lock") {
                    StreamScript::Fail {
                        detail: "connection refused".to_string(),
                    }
                } else {
                    StreamScript::Open {
                        envelopes: Vec::new(),
                        close: None,
                    }
                }
            }
        };

        match script {
            StreamScript::Fail { detail } => Err(ApiError::Transport(detail)),
            StreamScript::Open { envelopes, close } => {
                let (tx, rx) = mpsc::channel(envelopes.len().max(1) + 1);
                for envelope in envelopes {
                    let _ = tx.try_send(StreamSignal::Event(envelope));
                }
                match close {
                    Some(detail) => {
                        let _ = tx.try_send(StreamSignal::Closed { detail });
                    }
                    None => self.held_senders.lock().expect("lock").push(tx),
                }
                Ok(rx)
            }
        }
    }

    async fn submit_promotion(
        &self,
        _workspace_id: i64,
        _revision_id: i64,
        request: &PromotionTransitionRequest,
    ) -> Result<PromotionOutcome, ApiError> {
        self.promotion_requests
            .lock()
            .expect("lock")
            .push(request.clone());
        match self.promotions.lock().expect("lock").pop_front() {
            Some(MutationOutcome::Ok(confirmed)) => Ok(confirmed),
            Some(MutationOutcome::Status { status, body }) => {
                Err(ApiError::Status { status, body })
            }
            None => Err(ApiError::Transport("unscripted promotion".to_string())),
        }
    }

    async fn submit_run_approval(
        &self,
        _run_id: i64,
        request: &RunApprovalRequest,
    ) -> Result<RemediationRun, ApiError> {
        self.run_approval_requests
            .lock()
            .expect("lock")
            .push(request.clone());
        match self.run_approvals.lock().expect("lock").pop_front() {
            Some(MutationOutcome::Ok(confirmed)) => Ok(confirmed),
            Some(MutationOutcome::Status { status, body }) => {
                Err(ApiError::Status { status, body })
            }
            None => Err(ApiError::Transport("unscripted approval".to_string())),
        }
    }
}
