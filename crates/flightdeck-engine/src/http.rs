//! HTTP implementation of [`LifecycleApi`] against the console backend.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use flightdeck_core::{
    ConsoleEventEnvelope, LifecyclePage, PromotionOutcome, PromotionTransitionRequest,
    RemediationRun, RunApprovalRequest, SseFrameDecoder,
};

use crate::api::{ApiError, LifecycleApi, PageRequest, StreamRequest, StreamSignal};

const STREAM_CHANNEL_CAPACITY: usize = 64;

pub struct HttpLifecycleApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLifecycleApi {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { client, base_url }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl LifecycleApi for HttpLifecycleApi {
    async fn fetch_page(&self, request: &PageRequest) -> Result<LifecyclePage, ApiError> {
        let mut query = request.filters.query_params();
        if let Some(cursor) = request.cursor {
            query.push(("cursor", cursor.to_string()));
        }
        query.push(("limit", request.limit.to_string()));
        query.push(("run_limit", request.run_limit.to_string()));

        let response = self
            .client
            .get(format!("{}/api/lifecycle/workspaces", self.base_url))
            .query(&query)
            .send()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        let response = Self::check_status(response).await?;
        response
            .json::<LifecyclePage>()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))
    }

    async fn open_stream(
        &self,
        request: &StreamRequest,
    ) -> Result<mpsc::Receiver<StreamSignal>, ApiError> {
        let mut builder = self
            .client
            .get(format!("{}/api/lifecycle/stream", self.base_url))
            .query(&request.filters.query_params())
            .header("Accept", "text/event-stream");
        if let Some(cursor) = request.cursor {
            builder = builder.header("Last-Event-ID", cursor.to_string());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        let response = Self::check_status(response).await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(relay_stream(response, tx));
        Ok(rx)
    }

    async fn submit_promotion(
        &self,
        workspace_id: i64,
        revision_id: i64,
        request: &PromotionTransitionRequest,
    ) -> Result<PromotionOutcome, ApiError> {
        let response = self
            .client
            .post(format!(
                "{}/api/lifecycle/workspaces/{workspace_id}/revisions/{revision_id}/promotion",
                self.base_url
            ))
            .json(request)
            .send()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        let response = Self::check_status(response).await?;
        response
            .json::<PromotionOutcome>()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))
    }

    async fn submit_run_approval(
        &self,
        run_id: i64,
        request: &RunApprovalRequest,
    ) -> Result<RemediationRun, ApiError> {
        let response = self
            .client
            .post(format!(
                "{}/api/lifecycle/runs/{run_id}/approval",
                self.base_url
            ))
            .json(request)
            .send()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        let response = Self::check_status(response).await?;
        response
            .json::<RemediationRun>()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))
    }
}

/// Decode the response body into envelopes and forward them until the server
/// closes or the receiver is dropped. Dropping the receiver makes `send`
/// fail, which tears down this task and with it the connection.
async fn relay_stream(response: reqwest::Response, tx: mpsc::Sender<StreamSignal>) {
    let mut bytes_stream = response.bytes_stream();
    let mut decoder = SseFrameDecoder::default();
    let mut close_detail = "stream closed by server".to_string();

    while let Some(chunk_result) = bytes_stream.next().await {
        let chunk = match chunk_result {
            Ok(chunk) => chunk,
            Err(err) => {
                close_detail = format!("stream read failed: {err}");
                break;
            }
        };

        let report = decoder.push_chunk(&chunk);
        for err in report.errors {
            warn!(error = %err, "lifecycle stream frame error");
        }
        for frame in report.frames {
            if let Some(envelope) = parse_envelope(&frame.data) {
                if tx.send(StreamSignal::Event(envelope)).await.is_err() {
                    debug!("stream subscriber dropped, releasing connection");
                    return;
                }
            }
        }
    }

    let final_report = decoder.finish();
    for err in final_report.errors {
        warn!(error = %err, "lifecycle stream frame error");
    }
    for frame in final_report.frames {
        if let Some(envelope) = parse_envelope(&frame.data) {
            if tx.send(StreamSignal::Event(envelope)).await.is_err() {
                return;
            }
        }
    }

    let _ = tx
        .send(StreamSignal::Closed {
            detail: close_detail,
        })
        .await;
}

/// A malformed payload is dropped, not fatal: the stream carries independent
/// events and the next heartbeat resynchronizes the cursor.
fn parse_envelope(data: &str) -> Option<ConsoleEventEnvelope> {
    if data.is_empty() {
        return None;
    }
    match serde_json::from_str(data) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            warn!(error = %err, "dropping undecodable stream payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized_without_trailing_slash() {
        let api = HttpLifecycleApi::new(reqwest::Client::new(), "http://localhost:8080///");
        assert_eq!(api.base_url, "http://localhost:8080");
    }

    #[test]
    fn malformed_payloads_are_dropped_not_fatal() {
        assert!(parse_envelope("{not json").is_none());
        assert!(parse_envelope("").is_none());
        let envelope = parse_envelope(
            r#"{"type":"heartbeat","emitted_at":"2026-03-01T10:00:00Z","cursor":9}"#,
        )
        .expect("valid envelope");
        assert_eq!(envelope.cursor, Some(9));
    }
}
