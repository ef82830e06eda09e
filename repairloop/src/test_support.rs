//! Scripted collaborators and a throwaway project layout for tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::core::fingerprint::spec_fingerprint;
use crate::core::output::DEFAULT_OUTPUT_LIMIT_BYTES;
use crate::io::generator::{GenerationError, GenerationRequest, Generator};
use crate::io::state_store::{RunState, StateStore, read_document};
use crate::io::tools::{Tool, ToolRegistry, ToolResult};
use crate::io::workspace::{FileMap, WorkspaceWriter};
use crate::looping::Orchestrator;
use crate::shutdown::Shutdown;

pub const TEST_SPEC: &str = "Build an adder module with tests.\n";

#[derive(Debug)]
struct GeneratorScript {
    responses: VecDeque<Result<FileMap, GenerationError>>,
    repeat: Option<FileMap>,
    requests: Vec<GenerationRequest>,
}

/// Generator returning predetermined responses and recording every request.
///
/// Clones share the script, so a test can keep one handle and inspect the
/// requests after the orchestrator consumed the other.
#[derive(Debug, Clone)]
pub struct ScriptedGenerator {
    script: Arc<Mutex<GeneratorScript>>,
}

impl ScriptedGenerator {
    /// Responses are returned in order; afterwards every call is `Unavailable`.
    pub fn new(responses: Vec<Result<FileMap, GenerationError>>) -> Self {
        Self::from_script(responses.into(), None)
    }

    /// Every call returns `files`.
    pub fn repeating(files: FileMap) -> Self {
        Self::from_script(VecDeque::new(), Some(files))
    }

    fn from_script(
        responses: VecDeque<Result<FileMap, GenerationError>>,
        repeat: Option<FileMap>,
    ) -> Self {
        Self {
            script: Arc::new(Mutex::new(GeneratorScript {
                responses,
                repeat,
                requests: Vec::new(),
            })),
        }
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .clone()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<FileMap, GenerationError> {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        script.requests.push(request.clone());
        if let Some(response) = script.responses.pop_front() {
            return response;
        }
        match &script.repeat {
            Some(files) => Ok(files.clone()),
            None => Err(GenerationError::Unavailable("script exhausted".to_string())),
        }
    }
}

/// Verification tool that fails a fixed number of times, then passes.
#[derive(Debug)]
pub struct ScriptedTool {
    name: String,
    failures: Option<u32>,
    calls: AtomicU32,
    shutdown: Option<Shutdown>,
}

impl ScriptedTool {
    pub fn passes_after(failures: u32) -> Self {
        Self {
            name: "verify".to_string(),
            failures: Some(failures),
            calls: AtomicU32::new(0),
            shutdown: None,
        }
    }

    pub fn never_passes() -> Self {
        Self {
            failures: None,
            ..Self::passes_after(0)
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Request `shutdown` while running, as a signal arriving mid-test would.
    pub fn requesting_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<ToolResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(shutdown) = &self.shutdown {
            shutdown.request();
        }
        let passed = self.failures.is_some_and(|failures| call > failures);
        Ok(ToolResult {
            tool_name: self.name.clone(),
            passed,
            output: if passed {
                format!("attempt {call} passed")
            } else {
                format!("attempt {call} failed")
            },
            exit_code: if passed { 0 } else { 1 },
        })
    }
}

/// A temp directory holding a spec, a workspace and a state document.
pub struct TestProject {
    temp: TempDir,
    shutdown: Shutdown,
    max_retries: u32,
}

impl TestProject {
    /// Lay out the project and persist a fresh `INIT` state.
    pub fn new(max_retries: u32) -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let project = Self {
            temp,
            shutdown: Shutdown::new(),
            max_retries,
        };
        std::fs::write(project.spec_path(), TEST_SPEC).context("write spec")?;
        std::fs::create_dir_all(project.workspace()).context("create workspace")?;
        let mut store = StateStore::new(project.state_path());
        store
            .create_fresh("run-test", max_retries, &project.fingerprint())
            .context("create state")?;
        Ok(project)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn spec_path(&self) -> PathBuf {
        self.root().join("spec.md")
    }

    pub fn workspace(&self) -> PathBuf {
        self.root().join("workspace")
    }

    pub fn state_path(&self) -> PathBuf {
        self.root().join(".repairloop/state.json")
    }

    pub fn logs_path(&self) -> PathBuf {
        self.root().join(".repairloop/logs")
    }

    pub fn fingerprint(&self) -> String {
        spec_fingerprint(TEST_SPEC.as_bytes())
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn read_state(&self) -> Result<RunState> {
        read_document(&self.state_path()).map_err(anyhow::Error::from)
    }

    /// An orchestrator over this project's persisted state with one tool.
    pub fn orchestrator<G: Generator>(&self, generator: G, tool: ScriptedTool) -> Orchestrator<G> {
        self.orchestrator_with_tools(generator, vec![tool])
    }

    pub fn orchestrator_with_tools<G: Generator>(
        &self,
        generator: G,
        tools: Vec<ScriptedTool>,
    ) -> Orchestrator<G> {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            if let Err(err) = registry.register(Box::new(tool)) {
                panic!("register scripted tool: {err}");
            }
        }
        let store = StateStore::open(self.state_path())
            .unwrap_or_else(|err| panic!("open test state: {err}"));
        Orchestrator::new(
            store,
            generator,
            registry,
            WorkspaceWriter::new(self.workspace()),
            TEST_SPEC,
            self.shutdown.clone(),
            DEFAULT_OUTPUT_LIMIT_BYTES,
        )
    }
}
