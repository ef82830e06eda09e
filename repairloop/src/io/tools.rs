//! Verification tools and the ordered registry that runs them.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::io::harness::{HarnessRequest, TestHarness};
use crate::shutdown::Shutdown;

/// Outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_name: String,
    pub passed: bool,
    /// Captured output, already capped by the tool.
    pub output: String,
    pub exit_code: i32,
}

impl ToolResult {
    fn broken(name: &str, description: String) -> Self {
        Self {
            tool_name: name.to_string(),
            passed: false,
            output: description,
            exit_code: -1,
        }
    }
}

/// A named verification step.
///
/// `run` reports failures of the checked project as a non-passing
/// [`ToolResult`]; an `Err` means the tool itself broke.
pub trait Tool {
    fn name(&self) -> &str;
    fn run(&self) -> Result<ToolResult>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool {0:?} is already registered")]
    Duplicate(String),
}

/// Tools in registration order, with unique names.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<(), RegistryError> {
        if self.contains(tool.name()) {
            return Err(RegistryError::Duplicate(tool.name().to_string()));
        }
        debug!(tool = tool.name(), "registered tool");
        self.tools.push(tool);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|tool| tool.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|tool| tool.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run every tool in order. A tool that errors or panics yields a failed
    /// result with exit code `-1`; the remaining tools still run.
    ///
    /// Once `shutdown` is requested no further tool is started and the
    /// results gathered so far are returned.
    pub fn run_all(&self, shutdown: &Shutdown) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(self.tools.len());
        for tool in &self.tools {
            let name = tool.name();
            if shutdown.is_requested() {
                info!(
                    tool = name,
                    skipped = self.tools.len() - results.len(),
                    "shutdown requested, not starting remaining tools"
                );
                break;
            }
            let result = match catch_unwind(AssertUnwindSafe(|| tool.run())) {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    error!(tool = name, err = %format!("{err:#}"), "tool failed to run");
                    ToolResult::broken(name, format!("[tool {name} failed to run: {err:#}]"))
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(tool = name, panic = %message, "tool panicked");
                    ToolResult::broken(name, format!("[tool {name} panicked: {message}]"))
                }
            };
            info!(tool = name, passed = result.passed, exit_code = result.exit_code, "tool finished");
            results.push(result);
        }
        results
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Whether every result passed. No results is not a pass.
pub fn all_passed(results: &[ToolResult]) -> bool {
    !results.is_empty() && results.iter().all(|result| result.passed)
}

/// Render results as `--- [name] (rc=N) ---` blocks for the state document.
pub fn combined_output(results: &[ToolResult]) -> String {
    results
        .iter()
        .map(|result| {
            format!(
                "--- [{}] (rc={}) ---\n{}",
                result.tool_name, result.exit_code, result.output
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A [`Tool`] that runs a command through the [`TestHarness`].
pub struct CommandTool {
    name: String,
    harness: TestHarness,
    request: HarnessRequest,
}

impl CommandTool {
    pub fn new(
        name: impl Into<String>,
        harness: TestHarness,
        command: Vec<String>,
        cwd: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            harness,
            request: HarnessRequest {
                command,
                cwd: cwd.into(),
                timeout,
            },
        }
    }
}

impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<ToolResult> {
        let run = self.harness.run(&self.request);
        if !run.passed() {
            warn!(tool = %self.name, outcome = ?run.outcome, "verification did not pass");
        }
        Ok(ToolResult {
            tool_name: self.name.clone(),
            passed: run.passed(),
            exit_code: run.outcome.exit_code(),
            output: run.output,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;

    use super::*;

    struct Fixed {
        name: &'static str,
        behaviour: Behaviour,
    }

    enum Behaviour {
        Pass,
        Fail,
        Error,
        Panic,
    }

    impl Tool for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn run(&self) -> Result<ToolResult> {
            let passed = match self.behaviour {
                Behaviour::Pass => true,
                Behaviour::Fail => false,
                Behaviour::Error => return Err(anyhow!("binary missing")),
                Behaviour::Panic => panic!("boom"),
            };
            Ok(ToolResult {
                tool_name: self.name.to_string(),
                passed,
                output: format!("{} output", self.name),
                exit_code: if passed { 0 } else { 1 },
            })
        }
    }

    fn fixed(name: &'static str, behaviour: Behaviour) -> Box<dyn Tool> {
        Box::new(Fixed { name, behaviour })
    }

    #[test]
    fn duplicate_names_are_refused() {
        let mut registry = ToolRegistry::new();
        registry.register(fixed("verify", Behaviour::Pass)).expect("first");
        let err = registry
            .register(fixed("verify", Behaviour::Fail))
            .expect_err("duplicate");
        assert_eq!(err, RegistryError::Duplicate("verify".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn runs_in_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(fixed("lint", Behaviour::Pass)).expect("lint");
        registry.register(fixed("unit", Behaviour::Fail)).expect("unit");
        assert_eq!(registry.names(), vec!["lint", "unit"]);
        assert!(registry.contains("unit"));

        let results = registry.run_all(&Shutdown::new());
        let names: Vec<_> = results.iter().map(|r| r.tool_name.as_str()).collect();
        assert_eq!(names, vec!["lint", "unit"]);
        assert!(!all_passed(&results));
    }

    #[test]
    fn errors_and_panics_become_failed_results() {
        let mut registry = ToolRegistry::new();
        registry.register(fixed("broken", Behaviour::Error)).expect("broken");
        registry.register(fixed("crashy", Behaviour::Panic)).expect("crashy");
        registry.register(fixed("after", Behaviour::Pass)).expect("after");

        let results = registry.run_all(&Shutdown::new());
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].exit_code, -1);
        assert!(results[0].output.contains("binary missing"));
        assert_eq!(results[1].exit_code, -1);
        assert!(results[1].output.contains("boom"));
        assert!(results[2].passed);
    }

    struct StopsTheRun {
        shutdown: Shutdown,
    }

    impl Tool for StopsTheRun {
        fn name(&self) -> &str {
            "interrupted"
        }

        fn run(&self) -> Result<ToolResult> {
            self.shutdown.request();
            Ok(ToolResult::broken("interrupted", "[cancelled]".to_string()))
        }
    }

    struct Counting {
        runs: Arc<AtomicUsize>,
    }

    impl Tool for Counting {
        fn name(&self) -> &str {
            "later"
        }

        fn run(&self) -> Result<ToolResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(ToolResult {
                tool_name: "later".to_string(),
                passed: true,
                output: String::new(),
                exit_code: 0,
            })
        }
    }

    #[test]
    fn shutdown_stops_before_the_next_tool() {
        let shutdown = Shutdown::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry
            .register(Box::new(StopsTheRun {
                shutdown: shutdown.clone(),
            }))
            .expect("first");
        registry
            .register(Box::new(Counting { runs: Arc::clone(&runs) }))
            .expect("second");

        let results = registry.run_all(&shutdown);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_name, "interrupted");
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn requested_shutdown_runs_nothing() {
        let shutdown = Shutdown::new();
        shutdown.request();
        let mut registry = ToolRegistry::new();
        registry.register(fixed("lint", Behaviour::Pass)).expect("lint");
        assert!(registry.run_all(&shutdown).is_empty());
    }

    #[test]
    fn empty_registry_does_not_pass() {
        assert!(!all_passed(&ToolRegistry::new().run_all(&Shutdown::new())));
    }

    #[test]
    fn combined_output_labels_each_tool() {
        let results = vec![
            ToolResult {
                tool_name: "lint".to_string(),
                passed: true,
                output: "clean".to_string(),
                exit_code: 0,
            },
            ToolResult {
                tool_name: "unit".to_string(),
                passed: false,
                output: "1 failed".to_string(),
                exit_code: 1,
            },
        ];
        assert_eq!(
            combined_output(&results),
            "--- [lint] (rc=0) ---\nclean\n--- [unit] (rc=1) ---\n1 failed"
        );
    }
}
