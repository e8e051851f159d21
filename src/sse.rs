//! SSE frame decoding for the chat and pipeline event streams.

use crate::constants::SSE_DATA_PREFIX;
use crate::str_utils::utf8_valid_prefix;
use crate::types::{RelayError, Result};
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;

/// One decoded `data:` record. The wire shape is a flat JSON object whose
/// `type` field selects the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start {
        conversation_id: Option<String>,
        message_id: Option<String>,
    },
    Chunk {
        content: Option<String>,
    },
    Content {
        content: Option<String>,
    },
    Thinking {
        content: Option<String>,
    },
    MediaStart {
        media_name: Option<String>,
    },
    Info {
        message: Option<String>,
        content: Option<String>,
        #[serde(default, deserialize_with = "null_as_default")]
        media_names: Vec<String>,
    },
    Done {
        conversation_id: Option<String>,
        message_id: Option<String>,
        #[serde(default, deserialize_with = "null_as_default")]
        media_names: Vec<String>,
    },
    Error {
        error: Option<String>,
        stage: Option<usize>,
    },
    PipelineStart,
    StageStart {
        stage: Option<usize>,
        name: Option<String>,
        #[serde(default, deserialize_with = "null_as_default")]
        skipped: bool,
    },
    StageInfo {
        stage: Option<usize>,
        content: Option<String>,
    },
    StageChunk {
        stage: Option<usize>,
        content: Option<String>,
    },
    StageComplete {
        stage: Option<usize>,
        #[serde(default, deserialize_with = "millis")]
        duration_ms: Option<u64>,
    },
    PipelineComplete {
        #[serde(default, deserialize_with = "millis")]
        total_duration_ms: Option<u64>,
    },
    Result {
        run_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Treats an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Durations may be any JSON number; fractional milliseconds are rounded and
/// negative or non-finite values dropped.
pub(crate) fn millis<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| ms.round() as u64))
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Content { .. } => "content",
            StreamEvent::Thinking { .. } => "thinking",
            StreamEvent::MediaStart { .. } => "media_start",
            StreamEvent::Info { .. } => "info",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
            StreamEvent::PipelineStart => "pipeline_start",
            StreamEvent::StageStart { .. } => "stage_start",
            StreamEvent::StageInfo { .. } => "stage_info",
            StreamEvent::StageChunk { .. } => "stage_chunk",
            StreamEvent::StageComplete { .. } => "stage_complete",
            StreamEvent::PipelineComplete { .. } => "pipeline_complete",
            StreamEvent::Result { .. } => "result",
            StreamEvent::Unknown => "unknown",
        }
    }

    /// Encodes the event as a single SSE record, including the blank line.
    pub fn to_frame(&self) -> Result<String> {
        Ok(format!("{}{}\n\n", SSE_DATA_PREFIX, serde_json::to_string(self)?))
    }
}

/// Parses a single line. `Ok(None)` for lines that carry no data record.
pub fn parse_line(line: &str) -> std::result::Result<Option<StreamEvent>, RelayError> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let payload = match line.strip_prefix(SSE_DATA_PREFIX) {
        Some(p) => p,
        None => return Ok(None),
    };
    serde_json::from_str(payload)
        .map(Some)
        .map_err(|e| RelayError::MalformedFrame(e.to_string()))
}

/// Incremental decoder. Holds the incomplete trailing line (and any
/// incomplete UTF-8 sequence) between chunks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SseDecoder {
    residual: String,
    partial_utf8: Vec<u8>,
    skipped: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.partial_utf8.extend_from_slice(chunk);
        let (valid, incomplete) = utf8_valid_prefix(&self.partial_utf8);
        let keep_from = self.partial_utf8.len() - incomplete;
        let decoded = String::from_utf8_lossy(&self.partial_utf8[..keep_from]).into_owned();
        self.partial_utf8.drain(..keep_from);
        if valid < keep_from {
            tracing::debug!("Replaced invalid UTF-8 in SSE chunk");
        }
        self.feed_str(&decoded)
    }

    pub fn feed_str(&mut self, text: &str) -> Vec<StreamEvent> {
        self.residual.push_str(text);
        let mut events = Vec::new();

        let complete_upto = match self.residual.rfind('\n') {
            Some(idx) => idx,
            None => return events,
        };
        let rest = self.residual.split_off(complete_upto + 1);
        let complete = std::mem::replace(&mut self.residual, rest);

        for line in complete.split('\n') {
            self.push_line(line, &mut events);
        }
        events
    }

    /// Transport completed: decode whatever unterminated line remains.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.partial_utf8.is_empty() {
            let tail = String::from_utf8_lossy(&self.partial_utf8).into_owned();
            self.partial_utf8.clear();
            self.residual.push_str(&tail);
        }
        let line = std::mem::take(&mut self.residual);
        self.push_line(&line, &mut events);
        events
    }

    /// Number of `data:` lines dropped because they failed to parse.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn residual(&self) -> &str {
        &self.residual
    }

    fn push_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        match parse_line(line) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => {
                self.skipped += 1;
                tracing::debug!("Skipping SSE line: {}", e);
            }
        }
    }
}

struct DecodeState<S> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    queue: VecDeque<StreamEvent>,
    done: bool,
}

/// Lazily decodes a byte stream into events, in arrival order. Transport
/// errors are yielded once and end the stream.
pub fn decode_stream<S, E>(body: S) -> impl Stream<Item = Result<StreamEvent>>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Into<RelayError>,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        queue: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let events = state.decoder.feed(&bytes);
                    state.queue.extend(events);
                }
                Some(Err(e)) => {
                    state.done = true;
                    let err: RelayError = e.into();
                    return Some((Err(err.into()), state));
                }
                None => {
                    state.done = true;
                    let events = state.decoder.finish();
                    state.queue.extend(events);
                }
            }
        }
    })
}
