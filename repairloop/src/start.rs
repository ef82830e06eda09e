//! Start a new run or resume the one recorded in the state document.
//!
//! A "run" is one build-and-repair session identified by a stable `run_id`.
//! It is resumable only while its stored spec fingerprint matches the current
//! spec and it has not reached a terminal phase.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::info;

use crate::core::fingerprint::spec_fingerprint;
use crate::io::state_store::{RunState, StateStore};
use crate::io::workspace::clear_workspace;

/// Inputs to [`start_or_resume`].
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub max_retries: u32,
    /// Ignore any resumable state and start over.
    pub fresh: bool,
    /// Wipe the workspace when starting over.
    pub clear_workspace: bool,
}

/// Outcome of [`start_or_resume`].
#[derive(Debug)]
pub struct Started {
    pub store: StateStore,
    pub state: RunState,
    pub spec: String,
    pub resumed: bool,
}

/// Read the spec, then load a resumable run or create a fresh one.
pub fn start_or_resume(
    spec_path: &Path,
    workspace: &Path,
    state_path: &Path,
    options: &StartOptions,
) -> Result<Started> {
    let spec = read_spec(spec_path)?;
    let fingerprint = spec_fingerprint(spec.as_bytes());
    let mut store = StateStore::new(state_path);

    if !options.fresh
        && let Some(state) = store.load_existing(&fingerprint)
    {
        if state.max_retries != options.max_retries {
            info!(
                stored = state.max_retries,
                requested = options.max_retries,
                "resumed run keeps its stored retry budget"
            );
        }
        return Ok(Started {
            store,
            state,
            spec,
            resumed: true,
        });
    }

    if options.clear_workspace {
        clear_workspace(workspace, state_path)?;
    } else {
        fs::create_dir_all(workspace)
            .with_context(|| format!("create workspace {}", workspace.display()))?;
    }

    let run_id = generate_run_id();
    let state = store.create_fresh(&run_id, options.max_retries, &fingerprint)?;
    info!(run_id = %run_id, fingerprint = %fingerprint, "started fresh run");
    Ok(Started {
        store,
        state,
        spec,
        resumed: false,
    })
}

/// Read the specification as UTF-8. An empty spec is an error.
pub fn read_spec(path: &Path) -> Result<String> {
    let spec = fs::read_to_string(path).with_context(|| format!("read spec {}", path.display()))?;
    if spec.trim().is_empty() {
        return Err(anyhow!("spec {} is empty", path.display()));
    }
    Ok(spec)
}

/// `run-<UTC timestamp>-<6 lowercase alphanumerics>`.
pub fn generate_run_id() -> String {
    build_run_id(
        &Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
        &generate_short_id(),
    )
}

pub fn build_run_id(timestamp: &str, short_id: &str) -> String {
    format!("run-{timestamp}-{short_id}")
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}
