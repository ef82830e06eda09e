//! The build-and-repair loop.
//!
//! Each iteration reads the persisted phase and performs exactly one step:
//! generate, test, evaluate, or recover. Every step persists its outcome before
//! the next decision is made, so killing the process at any point leaves a
//! document that [`StateStore::load_existing`] can resume from.

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::core::output::cap_tail;
use crate::core::phase::{Phase, recovery_target};
use crate::io::generator::{GenerationError, GenerationRequest, Generator};
use crate::io::run_log::RunLog;
use crate::io::state_store::{RunState, StateError, StateStore, StateUpdate};
use crate::io::tools::{ToolRegistry, all_passed, combined_output};
use crate::io::workspace::{WorkspaceWriter, read_workspace_files};
use crate::shutdown::Shutdown;

/// Slack on top of the minimum number of iterations a run can need.
pub const ITERATION_MARGIN: u32 = 10;

/// Upper bound on loop iterations for a retry budget.
///
/// A repair cycle costs three iterations (patch, test, evaluate); the margin
/// covers recovery rewinds and the final terminal check.
pub fn iteration_ceiling(max_retries: u32) -> u32 {
    max_retries
        .saturating_add(1)
        .saturating_mul(3)
        .saturating_add(ITERATION_MARGIN)
}

/// Why [`Orchestrator::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    Success,
    Failed { reason: String },
    /// Shutdown was requested; the state is resumable as persisted.
    Interrupted,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub stop: LoopStop,
    pub state: RunState,
    pub iterations: u32,
}

/// Progress notifications for the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    Transition {
        from: Phase,
        to: Phase,
        attempt: u32,
        max_retries: u32,
    },
    Recovered {
        from: Phase,
        to: Phase,
    },
    Applied {
        written: usize,
        rejected: usize,
    },
    /// `attempt` is the attempt that was verified, before any increment.
    Tested {
        passed: bool,
        attempt: u32,
        max_retries: u32,
    },
}

enum Step {
    Continue,
    Interrupted,
}

/// Everything one run needs. The loop exclusively owns the state store and
/// the workspace for its lifetime.
pub struct Orchestrator<G: Generator> {
    store: StateStore,
    generator: G,
    registry: ToolRegistry,
    writer: WorkspaceWriter,
    spec: String,
    shutdown: Shutdown,
    output_limit_bytes: usize,
    run_log: Option<RunLog>,
    ceiling_override: Option<u32>,
}

impl<G: Generator> Orchestrator<G> {
    pub fn new(
        store: StateStore,
        generator: G,
        registry: ToolRegistry,
        writer: WorkspaceWriter,
        spec: impl Into<String>,
        shutdown: Shutdown,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            store,
            generator,
            registry,
            writer,
            spec: spec.into(),
            shutdown,
            output_limit_bytes,
            run_log: None,
            ceiling_override: None,
        }
    }

    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = Some(run_log);
        self
    }

    #[cfg(test)]
    fn with_iteration_ceiling(mut self, ceiling: u32) -> Self {
        self.ceiling_override = Some(ceiling);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Drive the run until it reaches a terminal phase or is interrupted.
    ///
    /// Errors are reserved for faults the loop cannot express as a run
    /// outcome (for example, the state document can no longer be written).
    pub fn run<F: FnMut(&LoopEvent)>(&mut self, mut on_event: F) -> Result<LoopOutcome> {
        let start = self.store.get()?;
        let ceiling = self
            .ceiling_override
            .unwrap_or_else(|| iteration_ceiling(start.max_retries));
        info!(run_id = %start.run_id, phase = %start.phase, attempt = start.attempt, ceiling, "loop starting");

        let mut iterations = 0u32;
        loop {
            iterations += 1;
            let state = self.store.get()?;

            if iterations > ceiling && !state.phase.is_terminal() {
                warn!(iterations, ceiling, "iteration limit reached");
                self.fail(&format!("iteration limit of {ceiling} reached"), &mut on_event)?;
                continue;
            }
            if state.phase.is_terminal() {
                return Ok(self.finish(state, iterations));
            }
            if state.attempt > state.max_retries {
                info!(attempt = state.attempt, max_retries = state.max_retries, "retry budget exhausted");
                self.fail("retry budget exhausted", &mut on_event)?;
                continue;
            }
            if recovery_target(state.phase, state.attempt).is_some() {
                if let Some(recovered) = self.store.recover()? {
                    self.record_transition(state.phase, recovered.phase);
                    on_event(&LoopEvent::Recovered {
                        from: state.phase,
                        to: recovered.phase,
                    });
                }
                continue;
            }
            if self.shutdown.is_requested() {
                return Ok(self.interrupted(state, iterations));
            }

            let step = match state.phase {
                Phase::Init => self.generate(&state, Phase::Generating, &mut on_event),
                Phase::Generated => self.test(&mut on_event),
                Phase::Tested if state.test_passed => self
                    .transition(StateUpdate::phase(Phase::Success), &mut on_event)
                    .map(|_| Step::Continue),
                Phase::Tested => self.generate(&state, Phase::Patching, &mut on_event),
                other => {
                    // Terminal and in-flight phases are handled above.
                    debug!(phase = %other, "no step for phase");
                    Ok(Step::Continue)
                }
            };

            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Interrupted) => {
                    let state = self.store.get()?;
                    return Ok(self.interrupted(state, iterations));
                }
                Err(err) => self.step_failed(err, &mut on_event)?,
            }
        }
    }

    /// An illegal transition is a loop bug: it fails the run instead of
    /// aborting it. Any other error is returned to the caller.
    fn step_failed<F: FnMut(&LoopEvent)>(
        &mut self,
        err: anyhow::Error,
        on_event: &mut F,
    ) -> Result<()> {
        match err.downcast_ref::<StateError>() {
            Some(StateError::IllegalTransition { from, to }) => {
                error!(%from, %to, "loop attempted an illegal transition");
                self.fail(
                    &format!("internal error: illegal transition {from} -> {to}"),
                    on_event,
                )?;
                Ok(())
            }
            _ => Err(err),
        }
    }

    /// Request a full project (`via == Generating`) or a repair (`via == Patching`)
    /// and apply it to the workspace.
    fn generate<F: FnMut(&LoopEvent)>(
        &mut self,
        state: &RunState,
        via: Phase,
        on_event: &mut F,
    ) -> Result<Step> {
        self.transition(StateUpdate::phase(via), on_event)?;

        let request = if via == Phase::Patching && state.attempt > 0 {
            let current = read_workspace_files(self.writer.root())?;
            debug!(files = current.len(), "requesting patch");
            GenerationRequest::patch(self.spec.as_str(), current, &state.last_test_output)
        } else {
            GenerationRequest::full(self.spec.as_str())
        };

        let files = match self.generator.generate(&request) {
            Ok(files) => files,
            Err(GenerationError::Cancelled) => return Ok(Step::Interrupted),
            Err(err) => return self.generation_failed(&err.to_string(), on_event),
        };

        let report = self.writer.apply(&files)?;
        on_event(&LoopEvent::Applied {
            written: report.written.len(),
            rejected: report.rejected.len(),
        });
        if report.written.is_empty() {
            return self.generation_failed("no generated file passed workspace checks", on_event);
        }

        self.transition(
            StateUpdate::phase(Phase::Generated)
                .attempt_files(report.written)
                .test_passed(false),
            on_event,
        )?;
        Ok(Step::Continue)
    }

    fn generation_failed<F: FnMut(&LoopEvent)>(
        &mut self,
        detail: &str,
        on_event: &mut F,
    ) -> Result<Step> {
        let reason = format!("generation failed: {detail}");
        error!(reason = %reason, "generation step failed");
        self.transition(
            StateUpdate::phase(Phase::Failed).failure_reason(reason),
            on_event,
        )?;
        Ok(Step::Continue)
    }

    /// Run every registered tool and record the verdict in a single update.
    fn test<F: FnMut(&LoopEvent)>(&mut self, on_event: &mut F) -> Result<Step> {
        self.transition(StateUpdate::phase(Phase::Testing), on_event)?;

        let results = self.registry.run_all(&self.shutdown);
        if self.shutdown.is_requested() {
            info!("verification interrupted; phase stays TESTING for resume");
            return Ok(Step::Interrupted);
        }

        let passed = all_passed(&results);
        let output = cap_tail(&combined_output(&results), self.output_limit_bytes);
        let names = self.registry.names();
        if let Some(log) = self.run_log.as_mut() {
            log.record_tool_run(names, passed);
        }

        let attempt = self.store.get()?.attempt;
        let mut update = StateUpdate::phase(Phase::Tested)
            .test_passed(passed)
            .last_test_output(output);
        if !passed {
            update = update.attempt(attempt.saturating_add(1));
        }
        let next = self.transition(update, on_event)?;
        if let Some(log) = self.run_log.as_mut() {
            log.set_retry_count(next.attempt);
        }
        on_event(&LoopEvent::Tested {
            passed,
            attempt,
            max_retries: next.max_retries,
        });
        Ok(Step::Continue)
    }

    fn transition<F: FnMut(&LoopEvent)>(
        &mut self,
        update: StateUpdate,
        on_event: &mut F,
    ) -> Result<RunState> {
        let from = self.store.get()?.phase;
        let next = self.store.update(update)?;
        if from != next.phase {
            self.record_transition(from, next.phase);
            on_event(&LoopEvent::Transition {
                from,
                to: next.phase,
                attempt: next.attempt,
                max_retries: next.max_retries,
            });
        }
        Ok(next)
    }

    fn fail<F: FnMut(&LoopEvent)>(&mut self, reason: &str, on_event: &mut F) -> Result<RunState> {
        let from = self.store.get()?.phase;
        let next = self.store.mark_failed(reason)?;
        self.record_transition(from, next.phase);
        on_event(&LoopEvent::Transition {
            from,
            to: next.phase,
            attempt: next.attempt,
            max_retries: next.max_retries,
        });
        Ok(next)
    }

    fn record_transition(&mut self, from: Phase, to: Phase) {
        if let Some(log) = self.run_log.as_mut() {
            log.record_transition(from, to);
        }
    }

    fn finish(&mut self, state: RunState, iterations: u32) -> LoopOutcome {
        let stop = match state.phase {
            Phase::Success => LoopStop::Success,
            _ => LoopStop::Failed {
                reason: state
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "run failed".to_string()),
            },
        };
        if let Some(log) = self.run_log.as_mut() {
            log.finalize(state.phase, state.failure_reason.as_deref());
        }
        info!(phase = %state.phase, attempt = state.attempt, iterations, "loop finished");
        LoopOutcome {
            stop,
            state,
            iterations,
        }
    }

    fn interrupted(&self, state: RunState, iterations: u32) -> LoopOutcome {
        warn!(phase = %state.phase, attempt = state.attempt, "loop interrupted");
        LoopOutcome {
            stop: LoopStop::Interrupted,
            state,
            iterations,
        }
    }
}
