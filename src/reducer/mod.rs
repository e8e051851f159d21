//! Client-side state machines that fold decoded events into UI state.

pub mod chat;
pub mod pipeline;

use crate::sse::StreamEvent;
use crate::types::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

pub use chat::{ChatOptions, ChatReducer, ChatState, ConversationTurn, Provenance, TurnRole};
pub use pipeline::{PipelineReducer, RunRecord, Section, StageRecord, StageStatus};

/// Anything that consumes a decoded event stream one event at a time.
pub trait StreamReducer {
    /// Applies one event. An `Err` ends the stream.
    fn apply(&mut self, event: &StreamEvent) -> Result<()>;
}

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
