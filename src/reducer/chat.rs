//! Chat reducer: folds `start`/`chunk`/`thinking`/`info`/`done` events into
//! an ordered list of conversation turns.
//!
//! At most one assistant turn is open at a time, and it is always the last
//! turn in the list: `info` turns are spliced in front of it, never after.

use super::{Clock, StreamReducer, SystemClock};
use crate::sse::StreamEvent;
use crate::thinking::ThinkingParser;
use crate::types::{ConversationId, RelayError, Result, TurnId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    Info,
}

/// Which pipeline/model produced a turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub pipeline: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: TurnId,
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_names: Vec<String>,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

impl ConversationTurn {
    fn new(id: TurnId, role: TurnRole, content: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            role,
            content,
            thinking: None,
            thinking_duration_secs: None,
            media_names: Vec::new(),
            conversation_id: None,
            created_at,
            provenance: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Idle,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThinkingPhase {
    NotStarted,
    Thinking,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Route in-band markers through the tokenizer.
    pub thinking: bool,
    pub provenance: Option<Provenance>,
}

#[derive(Debug)]
pub struct ChatReducer {
    turns: Vec<ConversationTurn>,
    state: ChatState,
    conversation_id: Option<ConversationId>,
    open: Option<TurnId>,
    pending_user: Option<TurnId>,
    message_id: Option<String>,
    options: ChatOptions,
    parser: ThinkingParser,
    phase: ThinkingPhase,
    request_started: Option<DateTime<Utc>>,
    seq: u64,
    clock: Arc<dyn Clock>,
}

impl ChatReducer {
    pub fn new(options: ChatOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    pub fn with_clock(options: ChatOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            turns: Vec::new(),
            state: ChatState::Idle,
            conversation_id: None,
            open: None,
            pending_user: None,
            message_id: None,
            options,
            parser: ThinkingParser::new(),
            phase: ThinkingPhase::NotStarted,
            request_started: None,
            seq: 0,
            clock,
        }
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn state(&self) -> ChatState {
        self.state
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: ChatOptions) {
        self.options = options;
    }

    pub fn open_turn(&self) -> Option<&ConversationTurn> {
        let idx = self.open_index()?;
        self.turns.get(idx)
    }

    /// Replaces the transcript with previously persisted turns.
    pub fn load_history(
        &mut self,
        turns: Vec<ConversationTurn>,
        conversation_id: Option<ConversationId>,
    ) {
        self.reset_stream();
        self.turns = turns;
        self.conversation_id = conversation_id;
    }

    pub fn clear(&mut self) {
        self.reset_stream();
        self.turns.clear();
        self.conversation_id = None;
    }

    /// Records the user's input and enters `Streaming`.
    pub fn submit_user(&mut self, text: &str) -> Result<TurnId> {
        if self.state == ChatState::Streaming {
            return Err(RelayError::internal("a response is already streaming").into());
        }
        self.reset_stream();

        let now = self.clock.now();
        let id = self.next_id("user");
        let mut turn = ConversationTurn::new(id.clone(), TurnRole::User, text.to_string(), now);
        turn.conversation_id = self.conversation_id.clone();
        self.turns.push(turn);

        self.pending_user = Some(id.clone());
        self.request_started = Some(now);
        self.state = ChatState::Streaming;
        Ok(id)
    }

    /// Opens the assistant placeholder. Idempotent while a turn is open.
    pub fn begin_response(&mut self) -> TurnId {
        if let Some(id) = &self.open {
            return id.clone();
        }
        let id = self.next_id("assistant");
        let mut turn =
            ConversationTurn::new(id.clone(), TurnRole::Assistant, String::new(), self.clock.now());
        turn.conversation_id = self.conversation_id.clone();
        turn.provenance = self.options.provenance.clone();
        self.turns.push(turn);
        self.open = Some(id.clone());
        if self.request_started.is_none() {
            self.request_started = Some(self.clock.now());
        }
        self.state = ChatState::Streaming;
        id
    }

    /// Transport completed normally: flush the tokenizer and freeze the turn.
    pub fn finish(&mut self) {
        if self.state != ChatState::Streaming {
            return;
        }
        let residual = self.parser.finish();
        if !residual.is_empty() {
            self.append_content(&residual);
        }
        if self.phase == ThinkingPhase::Thinking {
            self.close_thinking();
        }

        let conversation_id = self.conversation_id.clone();
        let message_id = self.message_id.take();
        if let Some(idx) = self.pending_user.take().and_then(|id| self.index_of(&id)) {
            if conversation_id.is_some() {
                self.turns[idx].conversation_id = conversation_id.clone();
            }
        }
        if let Some(idx) = self.open_index() {
            let turn = &mut self.turns[idx];
            if conversation_id.is_some() {
                turn.conversation_id = conversation_id;
            }
            if let Some(message_id) = message_id {
                turn.id = TurnId(message_id);
            }
            tracing::debug!(
                "[CHAT] Closed turn {} ({} chars, thinking: {})",
                turn.id,
                turn.content.len(),
                turn.thinking.as_ref().map_or(0, |t| t.len())
            );
        }
        self.open = None;
        self.state = ChatState::Idle;
    }

    /// Stream failed: drop the trailing assistant turn if nothing arrived.
    pub fn fail(&mut self) {
        self.flush_withheld();
        self.discard_empty_open();
        self.reset_stream();
    }

    /// Caller cancelled. No further events are applied.
    pub fn abort(&mut self) {
        self.flush_withheld();
        self.discard_empty_open();
        self.reset_stream();
    }

    /// Text the tokenizer was still holding back already arrived; keep it.
    fn flush_withheld(&mut self) {
        let residual = self.parser.finish();
        if residual.is_empty() {
            return;
        }
        if let Some(idx) = self.open_index() {
            self.turns[idx].content.push_str(&residual);
        }
    }

    fn reset_stream(&mut self) {
        self.state = ChatState::Idle;
        self.open = None;
        self.pending_user = None;
        self.message_id = None;
        self.parser = ThinkingParser::new();
        self.phase = ThinkingPhase::NotStarted;
        self.request_started = None;
    }

    fn discard_empty_open(&mut self) {
        if let Some(idx) = self.open_index() {
            if self.turns[idx].content.is_empty() {
                let removed = self.turns.remove(idx);
                tracing::debug!("[CHAT] Discarded empty turn {}", removed.id);
            }
        }
    }

    fn next_id(&mut self, prefix: &str) -> TurnId {
        self.seq += 1;
        TurnId(format!("{}-{}", prefix, self.seq))
    }

    fn index_of(&self, id: &TurnId) -> Option<usize> {
        self.turns.iter().rposition(|t| &t.id == id)
    }

    fn open_index(&self) -> Option<usize> {
        let id = self.open.as_ref()?;
        self.index_of(id)
    }

    fn open_index_or_begin(&mut self) -> Option<usize> {
        self.begin_response();
        self.open_index()
    }

    fn append_content(&mut self, text: &str) {
        if let Some(idx) = self.open_index_or_begin() {
            self.turns[idx].content.push_str(text);
        }
    }

    fn append_thinking(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(idx) = self.open_index_or_begin() {
            self.turns[idx]
                .thinking
                .get_or_insert_with(String::new)
                .push_str(text);
        }
        if self.phase == ThinkingPhase::NotStarted {
            self.phase = ThinkingPhase::Thinking;
        }
    }

    fn close_thinking(&mut self) {
        self.phase = ThinkingPhase::Closed;
        let started = match self.request_started {
            Some(t) => t,
            None => return,
        };
        let elapsed = self.clock.now() - started;
        let secs = elapsed.num_milliseconds().max(0) as f64 / 1000.0;
        if let Some(idx) = self.open_index() {
            self.turns[idx].thinking_duration_secs = Some(secs);
        }
    }

    fn on_content(&mut self, text: &str) {
        let (content, thinking) = if self.options.thinking {
            let delta = self.parser.feed(text);
            (delta.content, delta.thinking)
        } else {
            (text.to_string(), String::new())
        };

        self.append_thinking(&thinking);
        if content.is_empty() {
            // keep the placeholder open even if the tokenizer withheld everything
            self.begin_response();
            return;
        }
        if self.phase == ThinkingPhase::Thinking {
            self.close_thinking();
        }
        self.append_content(&content);
    }

    fn on_media_start(&mut self, name: &str) {
        let idx = match self.open_index_or_begin() {
            Some(idx) => idx,
            None => return,
        };
        let content = &mut self.turns[idx].content;
        if !content.is_empty() && !content.ends_with("\n\n") {
            content.push_str(if content.ends_with('\n') { "\n" } else { "\n\n" });
        }
        content.push_str(&format!("## {}\n\n", name));
    }

    fn on_info(&mut self, text: &str, media_names: &[String]) {
        let id = self.next_id("info");
        let mut turn = ConversationTurn::new(id, TurnRole::Info, text.to_string(), self.clock.now());
        turn.media_names = media_names.to_vec();
        turn.conversation_id = self.conversation_id.clone();
        match self.open_index() {
            Some(idx) => self.turns.insert(idx, turn),
            None => self.turns.push(turn),
        }
    }
}

impl StreamReducer for ChatReducer {
    fn apply(&mut self, event: &StreamEvent) -> Result<()> {
        if self.state != ChatState::Streaming {
            tracing::debug!("[CHAT] Ignoring {} event while idle", event.kind());
            return Ok(());
        }

        match event {
            StreamEvent::Start {
                conversation_id,
                message_id,
            } => {
                if let Some(id) = conversation_id {
                    self.conversation_id = Some(ConversationId(id.clone()));
                }
                if let Some(id) = message_id {
                    self.message_id = Some(id.clone());
                }
                self.begin_response();
            }
            StreamEvent::Thinking { content } => {
                if let Some(text) = content {
                    self.append_thinking(text);
                }
            }
            StreamEvent::Chunk { content } | StreamEvent::Content { content } => {
                if let Some(text) = content.as_deref().filter(|t| !t.is_empty()) {
                    self.on_content(text);
                }
            }
            StreamEvent::MediaStart { media_name } => {
                if let Some(name) = media_name {
                    self.on_media_start(name);
                }
            }
            StreamEvent::Info {
                message,
                content,
                media_names,
            } => {
                if let Some(text) = message.as_deref().or(content.as_deref()) {
                    self.on_info(text, media_names);
                }
            }
            StreamEvent::Done {
                conversation_id,
                message_id,
                media_names,
            } => {
                if let Some(id) = conversation_id {
                    self.conversation_id = Some(ConversationId(id.clone()));
                }
                if let Some(id) = message_id {
                    self.message_id = Some(id.clone());
                }
                if self.phase == ThinkingPhase::Thinking {
                    self.close_thinking();
                }
                if !media_names.is_empty() {
                    if let Some(idx) = self.open_index() {
                        self.turns[idx].media_names = media_names.clone();
                    }
                }
            }
            StreamEvent::Error { error, .. } => {
                let msg = error.clone().unwrap_or_else(|| "Unknown error".to_string());
                return Err(RelayError::StreamProtocol(msg).into());
            }
            other => {
                tracing::debug!("[CHAT] Ignoring {} event", other.kind());
            }
        }
        Ok(())
    }
}
