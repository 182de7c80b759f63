//! Run state and the append-only run directory stores.
//!
//! One directory per run under `marvel/runs/`. `run.json` holds the
//! current state; tool calls, injections, guidance and lesson outcomes
//! are append-only JSONL files beside it. `toolCallCount` is strictly
//! non-decreasing and equals the sequence number of the next tool-call
//! record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marvel_core::fsio;
use marvel_core::redact;
use marvel_packs::InjectedLesson;

use crate::guidance::{Guidance, GuidanceType};

const MAX_ACTIVITY_EVENTS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastInjection {
    pub file: String,
    pub packs: Vec<String>,
    pub scores: HashMap<String, u32>,
    pub lessons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub active_packs: Vec<String>,
    pub tool_call_count: u64,
    pub correction_count: u64,
    pub recent_activity: Vec<ActivityEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_injection: Option<LastInjection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    pub input_summary: String,
    pub output_summary: String,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionRecord {
    pub timestamp: DateTime<Utc>,
    pub file: String,
    pub lessons_injected: Vec<String>,
    pub packs_injected: Vec<String>,
}

/// Single writer for one run directory.
#[derive(Debug)]
pub struct RunStore {
    dir: PathBuf,
    state: RunState,
}

impl RunStore {
    /// Create the run directory and its initial `run.json`.
    pub fn create(runs_dir: &Path, active_packs: Vec<String>) -> std::io::Result<Self> {
        let started_at = Utc::now();
        let run_id = format!("run_{}", started_at.format("%Y%m%d_%H%M%S"));
        let dir = runs_dir.join(&run_id);
        std::fs::create_dir_all(&dir)?;

        let state = RunState {
            run_id,
            started_at,
            ended_at: None,
            active_packs,
            tool_call_count: 0,
            correction_count: 0,
            recent_activity: Vec::new(),
            last_injection: None,
        };
        let store = Self { dir, state };
        store.save();
        Ok(store)
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn save(&self) {
        fsio::write_json_best_effort(&self.dir.join("run.json"), &self.state, None);
    }

    fn push_activity(&mut self, kind: &str, detail: String) {
        self.state.recent_activity.push(ActivityEvent {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            detail,
        });
        let overflow = self.state.recent_activity.len().saturating_sub(MAX_ACTIVITY_EVENTS);
        if overflow > 0 {
            self.state.recent_activity.drain(..overflow);
        }
    }

    /// Append one tool-call record; the sequence is the pre-increment
    /// counter, so count always equals the number of records.
    pub fn record_tool_call(
        &mut self,
        tool: &str,
        input_summary: &str,
        output_summary: &str,
        success: bool,
    ) -> u64 {
        let sequence = self.state.tool_call_count;
        let record = ToolCallRecord {
            sequence,
            timestamp: Utc::now(),
            tool: tool.to_string(),
            input_summary: redact(input_summary),
            output_summary: redact(output_summary),
            success,
        };
        fsio::append_jsonl_best_effort(&self.dir.join("tool_calls.jsonl"), &record);

        self.state.tool_call_count += 1;
        self.push_activity("tool-call", format!("{tool} ({})", if success { "ok" } else { "failed" }));
        self.save();
        sequence
    }

    pub fn record_injection(
        &mut self,
        file: &str,
        lessons: &[InjectedLesson],
        packs: &[String],
        scores: HashMap<String, u32>,
    ) {
        let record = InjectionRecord {
            timestamp: Utc::now(),
            file: file.to_string(),
            lessons_injected: lessons.iter().map(|l| l.title.clone()).collect(),
            packs_injected: packs.to_vec(),
        };
        fsio::append_jsonl_best_effort(&self.dir.join("injections.jsonl"), &record);

        self.state.last_injection = Some(LastInjection {
            file: file.to_string(),
            packs: packs.to_vec(),
            scores,
            lessons: record.lessons_injected.clone(),
        });
        self.push_activity("injection", format!("{} packs into {file}", packs.len()));
        self.save();
    }

    pub fn record_guidance(&mut self, guidance: &Guidance) {
        fsio::append_jsonl_best_effort(&self.dir.join("guidance.jsonl"), guidance);
        if guidance.guidance_type == GuidanceType::Correction {
            self.state.correction_count += 1;
        }
        self.push_activity("guidance", format!("{:?}", guidance.guidance_type));
        self.save();
    }

    pub fn end(&mut self) {
        self.state.ended_at = Some(Utc::now());
        self.save();
    }

    /// Pre-compaction snapshot of the current state.
    pub fn snapshot(&self) {
        let name = format!("snapshot-{}.json", Utc::now().format("%Y%m%d%H%M%S"));
        fsio::write_json_best_effort(&self.dir.join(name), &self.state, None);
    }

    pub fn load_tool_calls(&self) -> Vec<ToolCallRecord> {
        fsio::read_jsonl(&self.dir.join("tool_calls.jsonl"))
    }

    pub fn load_injections(&self) -> Vec<InjectionRecord> {
        fsio::read_jsonl(&self.dir.join("injections.jsonl"))
    }

    pub fn load_guidance(&self) -> Vec<Guidance> {
        fsio::read_jsonl(&self.dir.join("guidance.jsonl"))
    }
}
