//! `repairloop status`: describe the persisted run without touching it.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;

use crate::core::fingerprint::spec_fingerprint;
use crate::core::output::tail_chars;
use crate::io::state_store::{RunState, StateCorruption, read_document};

const OUTPUT_PREVIEW_CHARS: usize = 2_000;

/// What `status` found at the state path.
#[derive(Debug)]
pub enum StatusReport {
    NoRun,
    Run {
        state: RunState,
        /// `None` when the spec could not be read.
        spec_matches: Option<bool>,
    },
}

/// Read the state document (no fingerprint gate, no recovery) and compare
/// its fingerprint with the spec at `spec_path`.
pub fn load_status(state_path: &Path, spec_path: &Path) -> Result<StatusReport, StateCorruption> {
    let state = match read_document(state_path) {
        Ok(state) => state,
        Err(StateCorruption::Missing) => return Ok(StatusReport::NoRun),
        Err(err) => return Err(err),
    };
    let spec_matches = std::fs::read(spec_path)
        .ok()
        .map(|spec| spec_fingerprint(&spec) == state.spec_fingerprint);
    Ok(StatusReport::Run {
        state,
        spec_matches,
    })
}

/// Human-readable rendering for stdout.
pub fn render_status(report: &StatusReport, verbose: bool) -> Result<String> {
    let mut out = String::new();
    let (state, spec_matches) = match report {
        StatusReport::NoRun => {
            writeln!(out, "no run recorded")?;
            return Ok(out);
        }
        StatusReport::Run {
            state,
            spec_matches,
        } => (state, spec_matches),
    };

    writeln!(out, "run_id:           {}", state.run_id)?;
    writeln!(out, "phase:            {}", state.phase)?;
    writeln!(out, "attempt:          {}/{}", state.attempt, state.max_retries)?;
    writeln!(out, "test_passed:      {}", state.test_passed)?;
    writeln!(out, "spec_fingerprint: {}", state.spec_fingerprint)?;
    let spec = match spec_matches {
        Some(true) => "matches current spec",
        Some(false) => "differs from current spec (next run starts fresh)",
        None => "current spec unreadable",
    };
    writeln!(out, "spec:             {spec}")?;
    writeln!(out, "updated_at:       {}", state.updated_at.to_rfc3339())?;
    if let Some(reason) = &state.failure_reason {
        writeln!(out, "failure_reason:   {reason}")?;
    }
    if state.attempt_files.is_empty() {
        writeln!(out, "attempt_files:    (none)")?;
    } else {
        writeln!(out, "attempt_files:")?;
        for file in &state.attempt_files {
            writeln!(out, "  {file}")?;
        }
    }
    if verbose && !state.last_test_output.is_empty() {
        writeln!(out, "last_test_output (tail):")?;
        writeln!(out, "{}", tail_chars(&state.last_test_output, OUTPUT_PREVIEW_CHARS))?;
    }
    Ok(out)
}
