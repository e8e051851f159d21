//! Pipeline reducer for the fixed six-stage proposal pipeline.

use super::StreamReducer;
use crate::constants::{STAGE_COUNT, STAGE_NAMES};
use crate::sse::StreamEvent;
use crate::sse::millis;
use crate::types::{RelayError, Result, RunId};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Error,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Skipped | StageStatus::Error
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: usize,
    pub name: String,
    pub status: StageStatus,
    pub duration_ms: Option<u64>,
}

/// Accumulated output of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub stage: usize,
    pub name: String,
    pub content: String,
    pub is_streaming: bool,
}

/// Persisted run as returned by `proposal-pipeline/runs/<id>`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRecord {
    #[serde(default, deserialize_with = "sections_array")]
    pub sections: Option<Vec<RunSection>>,
    #[serde(default)]
    pub stage_results: Option<HashMap<String, StageResult>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunSection {
    pub stage: usize,
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StageResult {
    pub status: Option<String>,
    #[serde(default, deserialize_with = "millis")]
    pub duration_ms: Option<u64>,
}

/// Anything other than a JSON array counts as "no saved sections".
fn sections_array<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<RunSection>>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        value @ serde_json::Value::Array(_) => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReducer {
    stages: Vec<StageRecord>,
    sections: Vec<Section>,
    current_stage: Option<usize>,
    run_id: Option<RunId>,
    pipeline_error: Option<String>,
    completed: bool,
}

impl Default for PipelineReducer {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineReducer {
    pub fn new() -> Self {
        Self {
            stages: initial_stages(),
            sections: Vec::new(),
            current_stage: None,
            run_id: None,
            pipeline_error: None,
            completed: false,
        }
    }

    /// Rebuilds the view of a finished run. Stages without a persisted
    /// result are shown as completed. A run saved without sections has no
    /// detail to show and is rejected.
    pub fn from_run(run_id: RunId, record: RunRecord) -> Result<Self> {
        let sections = match record.sections {
            Some(sections) => sections,
            None => {
                tracing::warn!("[PIPELINE] Run {} has no saved sections", run_id);
                return Err(RelayError::RunDetailMissing(run_id.0).into());
            }
        };

        let mut reducer = Self::new();
        reducer.run_id = Some(run_id);
        reducer.completed = true;

        let results = record.stage_results.unwrap_or_default();
        for stage in reducer.stages.iter_mut() {
            let result = results.get(&stage.stage.to_string());
            stage.status = match result.and_then(|r| r.status.as_deref()) {
                Some("skipped") => StageStatus::Skipped,
                Some("failed") => StageStatus::Error,
                _ => StageStatus::Completed,
            };
            stage.duration_ms = result.and_then(|r| r.duration_ms);
        }

        reducer.sections = sections
            .into_iter()
            .filter(|s| s.stage < STAGE_COUNT)
            .map(|s| Section {
                stage: s.stage,
                name: s.title,
                content: s.content.unwrap_or_default(),
                is_streaming: false,
            })
            .collect();
        Ok(reducer)
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn stage(&self, stage: usize) -> Option<&StageRecord> {
        self.stages.get(stage)
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, stage: usize) -> Option<&Section> {
        self.sections.iter().find(|s| s.stage == stage)
    }

    pub fn current_stage(&self) -> Option<usize> {
        self.current_stage
    }

    pub fn run_id(&self) -> Option<&RunId> {
        self.run_id.as_ref()
    }

    /// Error reported without a stage index.
    pub fn pipeline_error(&self) -> Option<&str> {
        self.pipeline_error.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Abort or transport failure: running stages go back to pending and
    /// lose their partial sections.
    pub fn interrupt(&mut self) {
        let mut dropped = Vec::new();
        for stage in self.stages.iter_mut() {
            if stage.status == StageStatus::Running {
                stage.status = StageStatus::Pending;
                stage.duration_ms = None;
                dropped.push(stage.stage);
            }
        }
        self.sections.retain(|s| !dropped.contains(&s.stage));
        self.current_stage = None;
        if !dropped.is_empty() {
            tracing::debug!("[PIPELINE] Interrupted stages {:?}", dropped);
        }
    }

    fn stage_index(&self, stage: Option<usize>, kind: &str) -> Option<usize> {
        match stage {
            Some(s) if s < STAGE_COUNT => Some(s),
            Some(s) => {
                tracing::warn!("[PIPELINE] Ignoring {} for unknown stage {}", kind, s);
                None
            }
            None => None,
        }
    }

    fn section_mut(&mut self, stage: usize) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.stage == stage)
    }

    fn open_section(&mut self, stage: usize, name: String, is_streaming: bool) {
        self.sections.retain(|s| s.stage != stage);
        self.sections.push(Section {
            stage,
            name,
            content: String::new(),
            is_streaming,
        });
    }

    fn on_stage_start(&mut self, stage: usize, name: Option<&str>, skipped: bool) {
        let record = &mut self.stages[stage];
        if record.status != StageStatus::Pending {
            tracing::warn!(
                "[PIPELINE] Stage {} already {:?}, ignoring stage_start",
                stage,
                record.status
            );
            return;
        }
        if let Some(name) = name {
            record.name = name.to_string();
        }
        record.status = if skipped {
            StageStatus::Skipped
        } else {
            StageStatus::Running
        };
        let name = record.name.clone();
        self.current_stage = Some(stage);
        self.open_section(stage, name, !skipped);
    }

    fn on_stage_text(&mut self, stage: usize, text: &str, newline: bool) {
        if self.stages[stage].status != StageStatus::Running {
            tracing::debug!("[PIPELINE] Dropping text for stage {} (not running)", stage);
            return;
        }
        if let Some(section) = self.section_mut(stage) {
            section.content.push_str(text);
            if newline {
                section.content.push('\n');
            }
        }
    }

    fn on_stage_complete(&mut self, stage: usize, duration_ms: Option<u64>) {
        let record = &mut self.stages[stage];
        if record.status != StageStatus::Running {
            tracing::warn!(
                "[PIPELINE] Stage {} is {:?}, ignoring stage_complete",
                stage,
                record.status
            );
            return;
        }
        record.status = StageStatus::Completed;
        record.duration_ms = duration_ms;
        if let Some(section) = self.section_mut(stage) {
            section.is_streaming = false;
        }
    }

    fn on_stage_error(&mut self, stage: usize, message: &str) {
        let record = &mut self.stages[stage];
        if record.status.is_terminal() {
            tracing::warn!(
                "[PIPELINE] Stage {} already {:?}, ignoring error",
                stage,
                record.status
            );
            return;
        }
        record.status = StageStatus::Error;
        let name = record.name.clone();
        if self.section_mut(stage).is_none() {
            self.open_section(stage, name, false);
        }
        if let Some(section) = self.section_mut(stage) {
            section.content.push_str(&format!("\n\nエラー: {}", message));
            section.is_streaming = false;
        }
    }
}

impl StreamReducer for PipelineReducer {
    /// Stage-scoped errors are recorded, not raised: later stages keep
    /// streaming.
    fn apply(&mut self, event: &StreamEvent) -> Result<()> {
        match event {
            StreamEvent::PipelineStart => self.reset(),
            StreamEvent::StageStart {
                stage,
                name,
                skipped,
            } => {
                if let Some(stage) = self.stage_index(*stage, "stage_start") {
                    self.on_stage_start(stage, name.as_deref(), *skipped);
                }
            }
            StreamEvent::StageInfo { stage, content } => {
                if let (Some(stage), Some(text)) =
                    (self.stage_index(*stage, "stage_info"), content.as_deref())
                {
                    if !text.is_empty() {
                        self.on_stage_text(stage, text, true);
                    }
                }
            }
            StreamEvent::StageChunk { stage, content } => {
                if let (Some(stage), Some(text)) =
                    (self.stage_index(*stage, "stage_chunk"), content.as_deref())
                {
                    self.on_stage_text(stage, text, false);
                }
            }
            StreamEvent::StageComplete { stage, duration_ms } => {
                if let Some(stage) = self.stage_index(*stage, "stage_complete") {
                    self.on_stage_complete(stage, *duration_ms);
                }
            }
            StreamEvent::PipelineComplete { .. } => {
                self.completed = true;
                self.current_stage = None;
            }
            StreamEvent::Result { run_id } => {
                if let Some(id) = run_id {
                    self.run_id = Some(RunId(id.clone()));
                }
            }
            StreamEvent::Error { error, stage } => {
                let message = error.as_deref().unwrap_or("不明なエラー");
                match stage {
                    Some(_) => {
                        if let Some(stage) = self.stage_index(*stage, "error") {
                            self.on_stage_error(stage, message);
                        }
                    }
                    None => {
                        tracing::warn!("[PIPELINE] Pipeline error: {}", message);
                        self.pipeline_error = Some(message.to_string());
                    }
                }
            }
            other => {
                tracing::debug!("[PIPELINE] Ignoring {} event", other.kind());
            }
        }
        Ok(())
    }
}

fn initial_stages() -> Vec<StageRecord> {
    STAGE_NAMES
        .iter()
        .enumerate()
        .map(|(stage, name)| StageRecord {
            stage,
            name: name.to_string(),
            status: StageStatus::Pending,
            duration_ms: None,
        })
        .collect()
}
