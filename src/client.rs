//! Client-side consumption of the relayed event streams.

use crate::reducer::{ChatOptions, ChatReducer, PipelineReducer, RunRecord, StreamReducer};
use crate::sse::decode_stream;
use crate::types::{RelayError, Result, RunId};
use bytes::Bytes;
use futures_util::{pin_mut, Stream, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Aborted,
}

/// Decodes `body` and folds every event into `reducer` until the transport
/// ends, the reducer rejects an event, or `cancel` fires. The body is
/// dropped on return either way.
pub async fn drive<S, E, R>(
    body: S,
    reducer: &mut R,
    cancel: &CancellationToken,
) -> Result<StreamOutcome>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Into<RelayError>,
    R: StreamReducer,
{
    let events = decode_stream(body);
    pin_mut!(events);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Stream consumer cancelled");
                return Ok(StreamOutcome::Aborted);
            }
            next = events.next() => match next {
                Some(Ok(event)) => reducer.apply(&event)?,
                Some(Err(e)) => return Err(e),
                None => return Ok(StreamOutcome::Completed),
            }
        }
    }
}

/// Turns a non-2xx reply into the matching error, using the body's
/// `detail`, `error` or `message` field when present.
pub async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.json::<Value>().await.unwrap_or(Value::Null);
    let detail = ["detail", "error", "message"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    if status == reqwest::StatusCode::UNAUTHORIZED {
        Err(RelayError::Unauthenticated(detail).into())
    } else {
        Err(RelayError::UpstreamUnavailable(detail).into())
    }
}

/// One chat transcript bound to a streaming endpoint.
pub struct ChatSession {
    client: reqwest::Client,
    endpoint: String,
    reducer: ChatReducer,
}

impl ChatSession {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, options: ChatOptions) -> Self {
        Self::with_reducer(client, endpoint, ChatReducer::new(options))
    }

    pub fn with_reducer(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        reducer: ChatReducer,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            reducer,
        }
    }

    pub fn reducer(&self) -> &ChatReducer {
        &self.reducer
    }

    pub fn reducer_mut(&mut self) -> &mut ChatReducer {
        &mut self.reducer
    }

    /// Request body for the meeting-minute chat endpoint.
    pub fn meeting_chat_body(&self, content: &str) -> Value {
        json!({
            "content": content,
            "conversation_id": self.reducer.conversation_id().map(|c| c.0.clone()),
        })
    }

    /// Request body for the proposal chat endpoint.
    pub fn proposal_chat_body(query: &str, knowledge_base_id: &str, area: Option<&str>) -> Value {
        let mut body = json!({
            "query": query,
            "knowledge_base_id": knowledge_base_id,
        });
        if let Some(area) = area.filter(|a| !a.is_empty()) {
            body["area"] = json!(area);
        }
        body
    }

    /// Records `text` as the user turn, POSTs `body`, and streams the reply
    /// into the transcript.
    pub async fn send(
        &mut self,
        text: &str,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome> {
        self.reducer.submit_user(text)?;

        let request = self.client.post(&self.endpoint).json(body).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.reducer.abort();
                return Ok(StreamOutcome::Aborted);
            }
            response = request => response,
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.reducer.fail();
                return Err(e.into());
            }
        };
        let response = match ensure_success(response).await {
            Ok(r) => r,
            Err(e) => {
                self.reducer.fail();
                return Err(e);
            }
        };

        self.reducer.begin_response();
        match drive(response.bytes_stream(), &mut self.reducer, cancel).await {
            Ok(StreamOutcome::Completed) => {
                self.reducer.finish();
                Ok(StreamOutcome::Completed)
            }
            Ok(StreamOutcome::Aborted) => {
                self.reducer.abort();
                Ok(StreamOutcome::Aborted)
            }
            Err(e) => {
                tracing::warn!("Chat stream failed: {}", e.inner);
                self.reducer.fail();
                Err(e)
            }
        }
    }
}

/// Drives the proposal pipeline stream for one meeting minute.
pub struct PipelineSession {
    client: reqwest::Client,
    endpoint: String,
    reducer: PipelineReducer,
}

impl PipelineSession {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            reducer: PipelineReducer::new(),
        }
    }

    pub fn reducer(&self) -> &PipelineReducer {
        &self.reducer
    }

    pub async fn execute(
        &mut self,
        minute_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome> {
        self.reducer.reset();

        let request = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "minute_id": minute_id }))
            .send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamOutcome::Aborted),
            response = request => response?,
        };
        let response = ensure_success(response).await?;

        match drive(response.bytes_stream(), &mut self.reducer, cancel).await {
            Ok(StreamOutcome::Completed) => Ok(StreamOutcome::Completed),
            Ok(StreamOutcome::Aborted) => {
                self.reducer.interrupt();
                Ok(StreamOutcome::Aborted)
            }
            Err(e) => {
                tracing::warn!("Pipeline stream failed: {}", e.inner);
                self.reducer.interrupt();
                Err(e)
            }
        }
    }

    /// Loads a finished run from `<runs_endpoint>/<run_id>`. The current view
    /// is left untouched when the run has no saved detail.
    pub async fn load_run(&mut self, runs_endpoint: &str, run_id: &RunId) -> Result<()> {
        let url = format!("{}/{}", runs_endpoint.trim_end_matches('/'), run_id);
        let response = ensure_success(self.client.get(&url).send().await?).await?;
        let record: RunRecord = response.json().await?;
        self.reducer = PipelineReducer::from_run(run_id.clone(), record)?;
        Ok(())
    }
}
