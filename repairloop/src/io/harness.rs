//! The verification harness: run the test command against the workspace with a
//! deadline, a scrubbed environment and a bounded transcript.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::output::{DEFAULT_OUTPUT_LIMIT_BYTES, cap_tail, truncation_marker};
use crate::io::process::{RunLimits, Termination, run_command};
use crate::shutdown::Shutdown;

/// Variables passed through to verification commands by default.
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TERM",
    "TMPDIR",
    "TZ",
    "SYSTEMROOT",
];

pub const DEFAULT_SEARCH_PATH_VAR: &str = "PYTHONPATH";
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Which parent variables a verification child may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPolicy {
    pub allowlist: Vec<String>,
    /// Variable that gets the workspace prepended (e.g. `PYTHONPATH`).
    pub search_path_var: Option<String>,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self {
            allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            search_path_var: Some(DEFAULT_SEARCH_PATH_VAR.to_string()),
        }
    }
}

impl EnvPolicy {
    /// The child environment derived from `parent`.
    ///
    /// A prior value of the search-path variable survives only when that
    /// variable is itself allow-listed.
    pub fn environment<I>(&self, parent: I, workspace: &Path) -> Vec<(OsString, OsString)>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut env: Vec<(OsString, OsString)> = parent
            .into_iter()
            .filter(|(key, _)| {
                key.to_str()
                    .is_some_and(|key| self.allowlist.iter().any(|allowed| allowed == key))
            })
            .collect();

        if let Some(var) = &self.search_path_var {
            let prior = env
                .iter()
                .position(|(key, _)| key.to_str() == Some(var.as_str()))
                .map(|idx| env.remove(idx).1);
            let mut entries = vec![workspace.to_path_buf()];
            if let Some(prior) = prior.filter(|value| !value.is_empty()) {
                entries.extend(std::env::split_paths(&prior));
            }
            let value = std::env::join_paths(entries)
                .unwrap_or_else(|_| workspace.as_os_str().to_os_string());
            env.push((OsString::from(var), value));
        }
        env
    }

    fn apply(&self, cmd: &mut Command, workspace: &Path) {
        cmd.env_clear();
        cmd.envs(self.environment(std::env::vars_os(), workspace));
    }
}

/// One verification invocation.
#[derive(Debug, Clone)]
pub struct HarnessRequest {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

/// How a verification run ended. Only `Exited { code: 0 }` passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessOutcome {
    Exited { code: i32 },
    Signalled,
    TimedOut,
    LaunchFailed { reason: String },
    Cancelled,
}

impl HarnessOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, HarnessOutcome::Exited { code: 0 })
    }

    /// The child's exit code, or `-1` when it did not exit on its own.
    pub fn exit_code(&self) -> i32 {
        match self {
            HarnessOutcome::Exited { code } => *code,
            _ => -1,
        }
    }
}

/// Result of [`TestHarness::run`].
#[derive(Debug, Clone)]
pub struct HarnessRun {
    pub outcome: HarnessOutcome,
    /// stdout, then a `--- stderr ---` section, then any harness notice; capped.
    pub output: String,
    pub duration: Duration,
}

impl HarnessRun {
    pub fn passed(&self) -> bool {
        self.outcome.passed()
    }
}

/// Runs verification commands.
#[derive(Debug, Clone)]
pub struct TestHarness {
    env: EnvPolicy,
    output_limit_bytes: usize,
    kill_grace: Duration,
    shutdown: Shutdown,
}

impl TestHarness {
    pub fn new(shutdown: Shutdown) -> Self {
        Self {
            env: EnvPolicy::default(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            kill_grace: DEFAULT_KILL_GRACE,
            shutdown,
        }
    }

    pub fn with_env_policy(mut self, env: EnvPolicy) -> Self {
        self.env = env;
        self
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn run(&self, request: &HarnessRequest) -> HarnessRun {
        let started = Instant::now();
        let Some((program, args)) = request.command.split_first() else {
            return self.launch_failed("verification command is empty", started);
        };
        if !request.cwd.is_dir() {
            let reason = format!(
                "working directory does not exist: {}",
                request.cwd.display()
            );
            return self.launch_failed(&reason, started);
        }

        let workspace = std::path::absolute(&request.cwd).unwrap_or_else(|_| request.cwd.clone());
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&workspace);
        self.env.apply(&mut cmd, &workspace);

        info!(command = ?request.command, timeout_secs = request.timeout.as_secs(), "running verification");
        let limits = RunLimits {
            timeout: request.timeout,
            kill_grace: self.kill_grace,
            output_limit_bytes: self.output_limit_bytes,
        };
        let output = match run_command(cmd, None, limits, &self.shutdown) {
            Ok(output) => output,
            Err(err) => return self.launch_failed(&format!("{err:#}"), started),
        };

        let mut text = stream_text(&output.stdout, output.stdout_total);
        if output.stderr_total > 0 {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("--- stderr ---\n");
            text.push_str(&stream_text(&output.stderr, output.stderr_total));
        }

        let outcome = match output.termination {
            Termination::Exited(status) => match status.code() {
                Some(code) => HarnessOutcome::Exited { code },
                None => {
                    push_notice(&mut text, &signal_notice(status));
                    HarnessOutcome::Signalled
                }
            },
            Termination::TimedOut => {
                push_notice(
                    &mut text,
                    &format!(
                        "[verification timed out after {}s; process group terminated]",
                        request.timeout.as_secs()
                    ),
                );
                HarnessOutcome::TimedOut
            }
            Termination::Cancelled => {
                push_notice(&mut text, "[verification cancelled; process group terminated]");
                HarnessOutcome::Cancelled
            }
        };

        let duration = started.elapsed();
        debug!(?outcome, duration_ms = duration.as_millis() as u64, "verification finished");
        HarnessRun {
            outcome,
            output: cap_tail(&text, self.output_limit_bytes),
            duration,
        }
    }

    fn launch_failed(&self, reason: &str, started: Instant) -> HarnessRun {
        warn!(reason, "verification could not start");
        HarnessRun {
            outcome: HarnessOutcome::LaunchFailed {
                reason: reason.to_string(),
            },
            output: cap_tail(
                &format!("[verification could not start: {reason}]\n"),
                self.output_limit_bytes,
            ),
            duration: started.elapsed(),
        }
    }
}

fn stream_text(tail: &[u8], total: usize) -> String {
    let text = String::from_utf8_lossy(tail);
    if total > tail.len() {
        format!("{}{text}", truncation_marker(tail.len(), total))
    } else {
        text.into_owned()
    }
}

fn push_notice(text: &mut String, notice: &str) {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(notice);
    text.push('\n');
}

#[cfg(unix)]
fn signal_notice(status: std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("[verification killed by signal {signal}]"),
        None => "[verification ended without an exit code]".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_notice(_status: std::process::ExitStatus) -> String {
    "[verification ended without an exit code]".to_string()
}
