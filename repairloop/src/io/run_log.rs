//! Per-run product log at `<logs>/<run_id>.json`.
//!
//! The log is an observer: every write failure is logged and swallowed.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::phase::Phase;
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionRecord {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolRunRecord {
    pub tools: Vec<String>,
    pub passed: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunLogDocument {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub generator: String,
    /// Times the run was picked up again after an interruption.
    #[serde(default)]
    pub resumes: u32,
    pub state_history: Vec<TransitionRecord>,
    pub tool_runs: Vec<ToolRunRecord>,
    pub retry_count: u32,
    pub final_phase: Option<Phase>,
    pub failure_reason: Option<String>,
}

#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    doc: RunLogDocument,
}

impl RunLog {
    /// Open the log for `run_id`, continuing an existing one when it parses.
    pub fn open(logs_dir: &Path, run_id: &str, generator: &str) -> Self {
        let path = logs_dir.join(format!("{run_id}.json"));
        let existing = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<RunLogDocument>(&raw).ok())
            .filter(|doc| doc.run_id == run_id);
        let doc = match existing {
            Some(mut doc) => {
                doc.resumes += 1;
                doc.ended_at = None;
                doc.final_phase = None;
                doc
            }
            None => RunLogDocument {
                run_id: run_id.to_string(),
                started_at: Utc::now(),
                ended_at: None,
                generator: generator.to_string(),
                resumes: 0,
                state_history: Vec::new(),
                tool_runs: Vec::new(),
                retry_count: 0,
                final_phase: None,
                failure_reason: None,
            },
        };
        let log = Self { path, doc };
        log.write();
        log
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &RunLogDocument {
        &self.doc
    }

    pub fn record_transition(&mut self, from: Phase, to: Phase) {
        if from == to {
            return;
        }
        self.doc.state_history.push(TransitionRecord {
            from,
            to,
            at: Utc::now(),
        });
        self.write();
    }

    pub fn record_tool_run(&mut self, tools: Vec<String>, passed: bool) {
        self.doc.tool_runs.push(ToolRunRecord {
            tools,
            passed,
            at: Utc::now(),
        });
        self.write();
    }

    pub fn set_retry_count(&mut self, count: u32) {
        self.doc.retry_count = count;
        self.write();
    }

    pub fn finalize(&mut self, phase: Phase, failure_reason: Option<&str>) {
        self.doc.ended_at = Some(Utc::now());
        self.doc.final_phase = Some(phase);
        self.doc.failure_reason = failure_reason.map(str::to_string);
        self.write();
    }

    fn write(&self) {
        match write_json_atomic(&self.path, &self.doc) {
            Ok(()) => debug!(path = %self.path.display(), "run log written"),
            Err(err) => warn!(path = %self.path.display(), err = %format!("{err:#}"), "failed to write run log"),
        }
    }
}
