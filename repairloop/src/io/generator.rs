//! The code-generation collaborator.
//!
//! The loop only sees the [`Generator`] trait. [`CommandGenerator`] is the
//! shipped backend: it spawns a configured command, writes a JSON request to
//! its stdin and reads `{"files": {...}}` from its stdout. Tests use scripted
//! generators that return predetermined file maps without spawning anything.

use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::output::tail_chars;
use crate::io::process::{RunLimits, Termination, run_command};
use crate::io::workspace::FileMap;
use crate::shutdown::Shutdown;

/// Files larger than this are dropped from a response.
pub const MAX_GENERATED_FILE_BYTES: usize = 512 * 1024;
/// At most this many files are kept from one response.
pub const MAX_GENERATED_FILES: usize = 100;
/// Failure output sent with a patch request keeps this many trailing characters.
pub const PATCH_FAILURE_OUTPUT_CHARS: usize = 15_000;
/// Exit code a generator command uses to report bad credentials.
pub const UNAUTHORIZED_EXIT_CODE: i32 = 77;

const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;
const STDERR_EXCERPT_CHARS: usize = 2_000;

/// What the loop asks for: a whole project, or a repaired one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub specification: String,
    /// Present for patch requests.
    pub current_files: Option<FileMap>,
    pub failure_output: Option<String>,
}

impl GenerationRequest {
    pub fn full(specification: impl Into<String>) -> Self {
        Self {
            specification: specification.into(),
            current_files: None,
            failure_output: None,
        }
    }

    pub fn patch(specification: impl Into<String>, current_files: FileMap, failure_output: &str) -> Self {
        Self {
            specification: specification.into(),
            current_files: Some(current_files),
            failure_output: Some(tail_chars(failure_output, PATCH_FAILURE_OUTPUT_CHARS).to_string()),
        }
    }

    pub fn is_patch(&self) -> bool {
        self.current_files.is_some()
    }
}

/// Why a generation step produced nothing usable. All of these end the run,
/// except `Cancelled`, which leaves it resumable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generator unavailable: {0}")]
    Unavailable(String),

    #[error("generator rejected credentials: {0}")]
    Unauthorized(String),

    #[error("generator timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("generator returned a malformed response: {0}")]
    Malformed(String),

    #[error("generator returned no usable files")]
    NoFiles,

    #[error("generation cancelled")]
    Cancelled,
}

/// Produces whole-file project contents from a specification.
pub trait Generator {
    fn generate(&self, request: &GenerationRequest) -> Result<FileMap, GenerationError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum Mode {
    Generate,
    Patch,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    mode: Mode,
    specification: &'a str,
    current_files: Option<&'a FileMap>,
    failure_output: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    files: FileMap,
}

/// Generator backed by an external command speaking JSON over stdio.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    name: String,
    command: Vec<String>,
    timeout: Duration,
    kill_grace: Duration,
    shutdown: Shutdown,
}

impl CommandGenerator {
    pub fn new(
        name: impl Into<String>,
        command: Vec<String>,
        timeout: Duration,
        kill_grace: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            timeout,
            kill_grace,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(generator = %self.name, patch = request.is_patch()))]
    fn generate(&self, request: &GenerationRequest) -> Result<FileMap, GenerationError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(GenerationError::Unavailable(
                "generator command is empty".to_string(),
            ));
        };
        let wire = WireRequest {
            mode: if request.is_patch() {
                Mode::Patch
            } else {
                Mode::Generate
            },
            specification: &request.specification,
            current_files: request.current_files.as_ref(),
            failure_output: request.failure_output.as_deref(),
        };
        let payload = serde_json::to_vec(&wire)
            .map_err(|err| GenerationError::Unavailable(format!("encode request: {err}")))?;

        info!(bytes = payload.len(), "requesting generation");
        let mut cmd = Command::new(program);
        cmd.args(args);
        let limits = RunLimits {
            timeout: self.timeout,
            kill_grace: self.kill_grace,
            output_limit_bytes: MAX_RESPONSE_BYTES,
        };
        let output = run_command(cmd, Some(payload), limits, &self.shutdown)
            .map_err(|err| GenerationError::Unavailable(format!("{err:#}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let excerpt = tail_chars(stderr.trim_end(), STDERR_EXCERPT_CHARS);
        match output.termination {
            Termination::TimedOut => return Err(GenerationError::Timeout(self.timeout)),
            Termination::Cancelled => return Err(GenerationError::Cancelled),
            Termination::Exited(status) => match status.code() {
                Some(0) => {}
                Some(UNAUTHORIZED_EXIT_CODE) => {
                    return Err(GenerationError::Unauthorized(excerpt.to_string()));
                }
                Some(code) => {
                    return Err(GenerationError::Unavailable(format!(
                        "exit code {code}: {excerpt}"
                    )));
                }
                None => {
                    return Err(GenerationError::Unavailable(format!(
                        "terminated by signal: {excerpt}"
                    )));
                }
            },
        }

        if output.stdout_total > output.stdout.len() {
            return Err(GenerationError::Malformed(format!(
                "response exceeded {MAX_RESPONSE_BYTES} bytes"
            )));
        }
        let response: WireResponse = serde_json::from_slice(&output.stdout)
            .map_err(|err| GenerationError::Malformed(err.to_string()))?;
        let files = filter_files(response.files);
        if files.is_empty() {
            return Err(GenerationError::NoFiles);
        }
        debug!(files = files.len(), "generation response accepted");
        Ok(files)
    }
}

/// Drop oversized entries and keep at most [`MAX_GENERATED_FILES`].
pub fn filter_files(files: FileMap) -> FileMap {
    let mut kept = FileMap::new();
    for (path, content) in files {
        if content.len() > MAX_GENERATED_FILE_BYTES {
            warn!(path = %path, bytes = content.len(), "dropping oversized generated file");
            continue;
        }
        if kept.len() >= MAX_GENERATED_FILES {
            warn!(limit = MAX_GENERATED_FILES, "generated file limit reached, dropping the rest");
            break;
        }
        kept.insert(path, content);
    }
    kept
}
