//! Persisted run state and its validated, crash-safe mutation.
//!
//! The state document (`state.json`) is the only record of where a run is.
//! Every mutation is validated against the phase table, written in full via
//! [`write_json_atomic`], and only then swapped into memory, so the in-memory
//! copy never runs ahead of disk.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::phase::{Phase, recovery_target};
use crate::io::atomic::write_json_atomic;

const RUN_STATE_SCHEMA: &str = include_str!("../../schemas/run_state.schema.json");

/// Persisted bookkeeping for one build-and-repair run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub run_id: String,
    pub phase: Phase,
    /// Patch cycles performed after the initial generation.
    pub attempt: u32,
    pub max_retries: u32,
    pub test_passed: bool,
    /// Combined verification output from the last test run (capped).
    pub last_test_output: String,
    /// Paths written by the last generation or patch step, in write order.
    pub attempt_files: Vec<String>,
    pub spec_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Why the run ended in `FAILED`, when it did.
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl RunState {
    fn fresh(run_id: &str, max_retries: u32, spec_fingerprint: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.to_string(),
            phase: Phase::Init,
            attempt: 0,
            max_retries,
            test_passed: false,
            last_test_output: String::new(),
            attempt_files: Vec::new(),
            spec_fingerprint: spec_fingerprint.to_string(),
            created_at: now,
            updated_at: now,
            failure_reason: None,
        }
    }
}

/// Partial update applied by [`StateStore::update`]. Unset fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateUpdate {
    pub phase: Option<Phase>,
    pub attempt: Option<u32>,
    pub test_passed: Option<bool>,
    pub last_test_output: Option<String>,
    pub attempt_files: Option<Vec<String>>,
    pub failure_reason: Option<String>,
}

impl StateUpdate {
    pub fn phase(phase: Phase) -> Self {
        Self {
            phase: Some(phase),
            ..Self::default()
        }
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn test_passed(mut self, passed: bool) -> Self {
        self.test_passed = Some(passed);
        self
    }

    pub fn last_test_output(mut self, output: impl Into<String>) -> Self {
        self.last_test_output = Some(output.into());
        self
    }

    pub fn attempt_files(mut self, files: Vec<String>) -> Self {
        self.attempt_files = Some(files);
        self
    }

    pub fn failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    fn apply_to(self, state: &mut RunState) {
        if let Some(phase) = self.phase {
            state.phase = phase;
        }
        if let Some(attempt) = self.attempt {
            state.attempt = attempt;
        }
        if let Some(passed) = self.test_passed {
            state.test_passed = passed;
        }
        if let Some(output) = self.last_test_output {
            state.last_test_output = output;
        }
        if let Some(files) = self.attempt_files {
            state.attempt_files = files;
        }
        if let Some(reason) = self.failure_reason {
            state.failure_reason = Some(reason);
        }
    }
}

/// Errors from mutating the run state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("illegal phase transition {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },

    #[error("run already reached terminal phase {0}")]
    Terminal(Phase),

    #[error("no run state loaded")]
    NotLoaded,

    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

/// Why a persisted document cannot be used.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateCorruption {
    #[error("state document does not exist")]
    Missing,

    #[error("state document is empty")]
    Empty,

    #[error("read state document: {0}")]
    Io(String),

    #[error("parse state document: {0}")]
    Parse(String),

    #[error("state document violates schema:\n- {}", .0.join("\n- "))]
    Schema(Vec<String>),
}

/// Owner of the persisted run state document.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Option<RunState>,
}

impl StateStore {
    /// A store bound to `path` with nothing loaded yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: None,
        }
    }

    /// Open the document at `path` as-is: no fingerprint gate, no recovery.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateCorruption> {
        let path = path.into();
        let state = read_document(&path)?;
        Ok(Self {
            path,
            state: Some(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start a new run: `INIT`, `attempt=0`, persisted immediately.
    pub fn create_fresh(
        &mut self,
        run_id: &str,
        max_retries: u32,
        spec_fingerprint: &str,
    ) -> Result<RunState, StateError> {
        let state = RunState::fresh(run_id, max_retries, spec_fingerprint);
        self.persist(&state)?;
        self.state = Some(state.clone());
        info!(run_id, max_retries, "created fresh run state");
        Ok(state)
    }

    /// Load a resumable run for the given spec fingerprint.
    ///
    /// Returns `None` (and logs why) when the document is missing, unreadable,
    /// violates the schema, is terminal, or belongs to a different spec. A
    /// resumable document has in-flight phases rewound before it is returned.
    pub fn load_existing(&mut self, spec_fingerprint: &str) -> Option<RunState> {
        let state = match read_document(&self.path) {
            Ok(state) => state,
            Err(StateCorruption::Missing) => {
                debug!(path = %self.path.display(), "no state document");
                return None;
            }
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "cannot resume: state document unusable");
                return None;
            }
        };

        if state.spec_fingerprint != spec_fingerprint {
            warn!(
                stored = %state.spec_fingerprint,
                current = %spec_fingerprint,
                "cannot resume: spec fingerprint changed"
            );
            return None;
        }
        if state.phase.is_terminal() {
            info!(run_id = %state.run_id, phase = %state.phase, "previous run already finished");
            return None;
        }

        info!(run_id = %state.run_id, phase = %state.phase, attempt = state.attempt, "resuming run");
        self.state = Some(state);
        if let Err(err) = self.recover() {
            warn!(err = %err, "cannot resume: failed to persist recovered phase");
            self.state = None;
            return None;
        }
        self.state.clone()
    }

    /// Snapshot of the current state.
    pub fn get(&self) -> Result<RunState, StateError> {
        self.state.clone().ok_or(StateError::NotLoaded)
    }

    /// Apply `update`, validating any phase change against the transition table.
    ///
    /// On error nothing changes, in memory or on disk.
    pub fn update(&mut self, update: StateUpdate) -> Result<RunState, StateError> {
        let current = self.state.as_ref().ok_or(StateError::NotLoaded)?;
        if current.phase.is_terminal() {
            return Err(StateError::Terminal(current.phase));
        }
        if let Some(target) = update.phase
            && target != current.phase
            && !current.phase.can_transition_to(target)
        {
            error!(
                from = %current.phase,
                to = %target,
                allowed = ?current.phase.allowed_targets(),
                "invalid phase transition"
            );
            return Err(StateError::IllegalTransition {
                from: current.phase,
                to: target,
            });
        }

        let mut next = current.clone();
        let from = next.phase;
        update.apply_to(&mut next);
        next.updated_at = Utc::now();
        self.persist(&next)?;

        debug!(
            from = %from,
            to = %next.phase,
            attempt = next.attempt,
            test_passed = next.test_passed,
            "state updated"
        );
        self.state = Some(next.clone());
        Ok(next)
    }

    /// Force the run into `FAILED`, recording `reason`.
    ///
    /// Unlike [`update`](Self::update) this does not consult the table: it is
    /// how budget exhaustion and internal errors end a run from any live phase.
    pub fn mark_failed(&mut self, reason: &str) -> Result<RunState, StateError> {
        let current = self.state.as_ref().ok_or(StateError::NotLoaded)?;
        if current.phase.is_terminal() {
            return Err(StateError::Terminal(current.phase));
        }
        let mut next = current.clone();
        let from = next.phase;
        next.phase = Phase::Failed;
        next.failure_reason = Some(reason.to_string());
        next.updated_at = Utc::now();
        self.persist(&next)?;

        warn!(from = %from, reason, "run marked failed");
        self.state = Some(next.clone());
        Ok(next)
    }

    /// Rewind an interrupted in-flight phase. Returns the rewritten state, or
    /// `None` when the current phase needs no recovery.
    pub fn recover(&mut self) -> Result<Option<RunState>, StateError> {
        let current = self.state.as_ref().ok_or(StateError::NotLoaded)?;
        let Some(target) = recovery_target(current.phase, current.attempt) else {
            return Ok(None);
        };
        let mut next = current.clone();
        let from = next.phase;
        next.phase = target;
        next.updated_at = Utc::now();
        self.persist(&next)?;

        warn!(from = %from, to = %target, attempt = next.attempt, "recovered interrupted phase");
        self.state = Some(next.clone());
        Ok(Some(next))
    }

    fn persist(&self, state: &RunState) -> Result<(), StateError> {
        write_json_atomic(&self.path, state)?;
        Ok(())
    }
}

/// Read and validate a state document without any resume policy.
pub fn read_document(path: &Path) -> Result<RunState, StateCorruption> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(StateCorruption::Missing),
        Err(err) => return Err(StateCorruption::Io(err.to_string())),
    };
    if raw.trim().is_empty() {
        return Err(StateCorruption::Empty);
    }
    let value: Value =
        serde_json::from_str(&raw).map_err(|err| StateCorruption::Parse(err.to_string()))?;
    validate_schema(&value)?;
    serde_json::from_value(value).map_err(|err| StateCorruption::Parse(err.to_string()))
}

/// Validate a state document against the embedded JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value) -> Result<(), StateCorruption> {
    let schema: Value = serde_json::from_str(RUN_STATE_SCHEMA)
        .map_err(|err| StateCorruption::Schema(vec![format!("parse schema: {err}")]))?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| StateCorruption::Schema(vec![format!("compile schema: {err}")]))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(StateCorruption::Schema(messages));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP: &str = "sha256:0123456789abcdef";

    fn store_in(dir: &Path) -> StateStore {
        StateStore::new(dir.join("state.json"))
    }

    /// Write a document in `phase` directly, bypassing the table.
    fn seed_phase(dir: &Path, phase: Phase, attempt: u32) -> PathBuf {
        let path = dir.join("state.json");
        let mut state = RunState::fresh("run-seed", 3, FP);
        state.phase = phase;
        state.attempt = attempt;
        write_json_atomic(&path, &state).expect("seed");
        path
    }

    /// `create_fresh` followed by `load_existing` yields the identical document.
    #[test]
    fn fresh_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path());
        let created = store.create_fresh("run-1", 2, FP).expect("create");
        let bytes_before = fs::read(store.path()).expect("read");

        let mut reopened = store_in(temp.path());
        let loaded = reopened.load_existing(FP).expect("resumable");
        assert_eq!(loaded, created);
        assert_eq!(loaded.phase, Phase::Init);
        assert_eq!(loaded.attempt, 0);
        assert_eq!(fs::read(reopened.path()).expect("read"), bytes_before);
    }

    /// Every phase pair outside the table is refused and the file is untouched.
    #[test]
    fn illegal_transitions_leave_document_byte_identical() {
        for from in Phase::ALL {
            for to in Phase::ALL {
                if to == from || from.can_transition_to(to) {
                    continue;
                }
                let temp = tempfile::tempdir().expect("tempdir");
                let path = seed_phase(temp.path(), from, 1);
                let before = fs::read(&path).expect("read before");

                let mut store = StateStore::open(&path).expect("open");
                let err = store
                    .update(StateUpdate::phase(to).attempt(9))
                    .expect_err("transition must fail");
                if from.is_terminal() {
                    assert!(matches!(err, StateError::Terminal(_)), "{from}->{to}: {err}");
                } else {
                    assert!(
                        matches!(err, StateError::IllegalTransition { .. }),
                        "{from}->{to}: {err}"
                    );
                }
                assert_eq!(fs::read(&path).expect("read after"), before, "{from}->{to}");
                assert_eq!(store.get().expect("get").phase, from);
                assert_eq!(store.get().expect("get").attempt, 1);
            }
        }
    }

    #[test]
    fn legal_transition_persists_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path());
        store.create_fresh("run-2", 1, FP).expect("create");
        store
            .update(StateUpdate::phase(Phase::Generating))
            .expect("generating");
        let updated = store
            .update(StateUpdate::phase(Phase::Generated).attempt_files(vec!["a.py".into()]))
            .expect("generated");
        assert_eq!(updated.attempt_files, vec!["a.py".to_string()]);

        let on_disk = read_document(store.path()).expect("read");
        assert_eq!(on_disk, updated);
        assert!(on_disk.updated_at >= on_disk.created_at);
    }

    #[test]
    fn get_returns_a_snapshot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path());
        store.create_fresh("run-3", 1, FP).expect("create");
        let mut snapshot = store.get().expect("get");
        snapshot.attempt = 42;
        assert_eq!(store.get().expect("get").attempt, 0);
    }

    #[test]
    fn fingerprint_mismatch_is_not_resumable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path());
        store.create_fresh("run-4", 1, FP).expect("create");
        let mut other = store_in(temp.path());
        assert!(other.load_existing("sha256:ffffffffffffffff").is_none());
        assert!(other.get().is_err());
    }

    #[test]
    fn terminal_runs_are_not_resumable() {
        for phase in [Phase::Success, Phase::Failed] {
            let temp = tempfile::tempdir().expect("tempdir");
            seed_phase(temp.path(), phase, 0);
            assert!(store_in(temp.path()).load_existing(FP).is_none());
        }
    }

    #[test]
    fn corrupt_documents_are_not_resumable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        for contents in ["", "   \n", "{not json", "[]", "{\"run_id\": \"x\"}"] {
            fs::write(&path, contents).expect("write");
            assert!(store_in(temp.path()).load_existing(FP).is_none(), "{contents:?}");
        }
    }

    #[test]
    fn missing_required_key_is_schema_violation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = seed_phase(temp.path(), Phase::Tested, 1);
        let mut value: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        value.as_object_mut().expect("object").remove("attempt_files");
        fs::write(&path, serde_json::to_string(&value).expect("ser")).expect("write");

        match read_document(&path) {
            Err(StateCorruption::Schema(messages)) => {
                assert!(messages.iter().any(|m| m.contains("attempt_files")), "{messages:?}");
            }
            other => panic!("expected schema violation, got {other:?}"),
        }
    }

    #[test]
    fn unknown_phase_and_negative_attempt_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = seed_phase(temp.path(), Phase::Tested, 1);
        let original = fs::read_to_string(&path).expect("read");

        let bad_phase = original.replace("\"TESTED\"", "\"DONE\"");
        fs::write(&path, bad_phase).expect("write");
        assert!(matches!(read_document(&path), Err(StateCorruption::Schema(_))));

        let bad_attempt = original.replace("\"attempt\": 1", "\"attempt\": -1");
        fs::write(&path, bad_attempt).expect("write");
        assert!(matches!(read_document(&path), Err(StateCorruption::Schema(_))));
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = seed_phase(temp.path(), Phase::Tested, 1);
        let mut value: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        value
            .as_object_mut()
            .expect("object")
            .insert("written_by".to_string(), Value::String("v9".into()));
        fs::write(&path, serde_json::to_string(&value).expect("ser")).expect("write");

        let loaded = store_in(temp.path()).load_existing(FP).expect("resumable");
        assert_eq!(loaded.phase, Phase::Tested);
    }

    /// In-flight phases are rewound on resume and the rewrite is persisted.
    #[test]
    fn resume_rewinds_in_flight_phases() {
        let cases = [
            (Phase::Generating, 0, Phase::Init),
            (Phase::Generating, 2, Phase::Tested),
            (Phase::Testing, 1, Phase::Generated),
            (Phase::Patching, 1, Phase::Tested),
            (Phase::Generated, 1, Phase::Generated),
        ];
        for (stored, attempt, expected) in cases {
            let temp = tempfile::tempdir().expect("tempdir");
            let path = seed_phase(temp.path(), stored, attempt);
            let loaded = store_in(temp.path()).load_existing(FP).expect("resumable");
            assert_eq!(loaded.phase, expected, "{stored}");
            assert_eq!(loaded.attempt, attempt);
            assert_eq!(read_document(&path).expect("read").phase, expected);
        }
    }

    #[test]
    fn mark_failed_records_reason_from_any_live_phase() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = seed_phase(temp.path(), Phase::Generated, 3);
        let mut store = StateStore::open(&path).expect("open");
        let failed = store.mark_failed("retry budget exhausted").expect("fail");
        assert_eq!(failed.phase, Phase::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("retry budget exhausted"));

        let err = store.mark_failed("again").expect_err("terminal");
        assert!(matches!(err, StateError::Terminal(Phase::Failed)));
    }

    #[test]
    fn same_phase_update_is_allowed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = seed_phase(temp.path(), Phase::Tested, 1);
        let mut store = StateStore::open(&path).expect("open");
        let updated = store
            .update(StateUpdate::phase(Phase::Tested).attempt(2))
            .expect("same phase");
        assert_eq!(updated.attempt, 2);
    }
}
