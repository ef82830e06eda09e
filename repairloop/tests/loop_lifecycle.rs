//! Loop-level tests for full run lifecycles.
//!
//! These drive `Orchestrator::run` against a persisted state document with
//! scripted collaborators: repair cycles, generation failures, crash and
//! interrupt recovery, and the spec-fingerprint gate.

use std::fs;

use repairloop::core::output::DEFAULT_OUTPUT_LIMIT_BYTES;
use repairloop::core::phase::Phase;
use repairloop::io::generator::GenerationError;
use repairloop::io::run_log::RunLog;
use repairloop::io::state_store::{StateStore, StateUpdate};
use repairloop::io::tools::ToolRegistry;
use repairloop::io::workspace::{FileMap, WorkspaceWriter};
use repairloop::looping::{LoopEvent, LoopStop, Orchestrator};
use repairloop::shutdown::Shutdown;
use repairloop::start::{StartOptions, start_or_resume};
use repairloop::test_support::{ScriptedGenerator, ScriptedTool, TEST_SPEC, TestProject};

fn project_files() -> FileMap {
    let mut files = FileMap::new();
    files.insert("adder.py".to_string(), "def add(a, b):\n    return a + b\n".to_string());
    files.insert(
        "test_adder.py".to_string(),
        "from adder import add\n\ndef test_add():\n    assert add(2, 3) == 5\n".to_string(),
    );
    files
}

/// Drive the persisted state forward the way an interrupted run would have.
fn advance(project: &TestProject, updates: Vec<StateUpdate>) {
    let mut store = StateStore::open(project.state_path()).expect("open state");
    for update in updates {
        store.update(update).expect("update");
    }
}

#[test]
fn repairs_until_tests_pass() {
    let project = TestProject::new(2).expect("project");
    let generator = ScriptedGenerator::repeating(project_files());
    let run_log = RunLog::open(&project.logs_path(), "run-test", "scripted");
    let mut orchestrator = project
        .orchestrator(generator.clone(), ScriptedTool::passes_after(2))
        .with_run_log(run_log);

    let outcome = orchestrator.run(|_| {}).expect("run");

    assert_eq!(outcome.stop, LoopStop::Success);
    let state = project.read_state().expect("state");
    assert_eq!(state.phase, Phase::Success);
    assert_eq!(state.attempt, 2);
    assert_eq!(state.max_retries, project.max_retries());
    assert!(state.test_passed);
    assert!(state.last_test_output.contains("attempt 3 passed"));

    let requests = generator.requests();
    assert_eq!(requests.len(), 3);
    assert!(!requests[0].is_patch());
    assert!(requests[1..].iter().all(|request| request.is_patch()));
    assert_eq!(
        requests[2].failure_output.as_deref().map(|out| out.contains("attempt 2 failed")),
        Some(true)
    );

    let log = orchestrator_log(&project);
    assert_eq!(log["final_phase"], "SUCCESS");
    assert_eq!(log["retry_count"], 2);
    assert_eq!(log["tool_runs"].as_array().map(Vec::len), Some(3));
    assert!(log["ended_at"].is_string());
}

fn orchestrator_log(project: &TestProject) -> serde_json::Value {
    let raw = fs::read_to_string(project.logs_path().join("run-test.json")).expect("read log");
    serde_json::from_str(&raw).expect("parse log")
}

#[test]
fn missing_generation_fails_without_consuming_attempts() {
    let project = TestProject::new(3).expect("project");
    let generator = ScriptedGenerator::new(vec![Err(GenerationError::NoFiles)]);
    let mut orchestrator = project.orchestrator(generator, ScriptedTool::passes_after(0));

    let outcome = orchestrator.run(|_| {}).expect("run");

    let state = project.read_state().expect("state");
    assert_eq!(state.phase, Phase::Failed);
    assert_eq!(state.attempt, 0);
    let reason = state.failure_reason.expect("failure reason");
    assert!(reason.starts_with("generation failed"), "{reason}");
    assert_eq!(outcome.stop, LoopStop::Failed { reason });
}

#[test]
fn empty_file_map_is_a_generation_failure() {
    let project = TestProject::new(1).expect("project");
    let generator = ScriptedGenerator::new(vec![Ok(FileMap::new())]);
    let mut orchestrator = project.orchestrator(generator, ScriptedTool::passes_after(0));

    orchestrator.run(|_| {}).expect("run");

    let state = project.read_state().expect("state");
    assert_eq!(state.phase, Phase::Failed);
    assert_eq!(state.attempt, 0);
    assert!(state.attempt_files.is_empty());
}

#[test]
fn escaping_paths_never_leave_the_workspace() {
    let project = TestProject::new(0).expect("project");
    let mut files = project_files();
    files.insert("../outside.txt".to_string(), "x".to_string());
    let generator = ScriptedGenerator::new(vec![Ok(files)]);
    let mut orchestrator = project.orchestrator(generator, ScriptedTool::passes_after(0));

    let mut rejected = 0;
    let outcome = orchestrator
        .run(|event| {
            if let LoopEvent::Applied { rejected: count, .. } = event {
                rejected += count;
            }
        })
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Success);
    assert_eq!(rejected, 1);
    assert!(!project.root().join("outside.txt").exists());
    assert_eq!(outcome.state.attempt_files, vec!["adder.py", "test_adder.py"]);
}

#[test]
fn every_tool_must_pass() {
    let project = TestProject::new(1).expect("project");
    let generator = ScriptedGenerator::repeating(project_files());
    let mut orchestrator = project.orchestrator_with_tools(
        generator,
        vec![
            ScriptedTool::passes_after(0).named("lint"),
            ScriptedTool::never_passes(),
        ],
    );

    let outcome = orchestrator.run(|_| {}).expect("run");

    assert!(matches!(outcome.stop, LoopStop::Failed { .. }));
    let output = &outcome.state.last_test_output;
    assert!(output.contains("--- [lint] (rc=0) ---"), "{output}");
    assert!(output.contains("--- [verify] (rc=1) ---"), "{output}");
    assert!(output.find("[lint]") < output.find("[verify]"));
}

#[test]
fn crash_during_generation_resumes_by_regenerating() {
    let project = TestProject::new(2).expect("project");
    advance(&project, vec![StateUpdate::phase(Phase::Generating)]);

    let generator = ScriptedGenerator::repeating(project_files());
    let mut orchestrator = project.orchestrator(generator.clone(), ScriptedTool::passes_after(0));
    let mut events = Vec::new();
    let outcome = orchestrator.run(|event| events.push(event.clone())).expect("run");

    assert_eq!(outcome.stop, LoopStop::Success);
    assert_eq!(
        events.first(),
        Some(&LoopEvent::Recovered {
            from: Phase::Generating,
            to: Phase::Init,
        })
    );
    assert_eq!(generator.requests().len(), 1);
}

#[test]
fn crash_during_testing_reruns_tests_without_regenerating() {
    let project = TestProject::new(2).expect("project");
    WorkspaceWriter::new(project.workspace())
        .apply(&project_files())
        .expect("seed workspace");
    advance(
        &project,
        vec![
            StateUpdate::phase(Phase::Generating),
            StateUpdate::phase(Phase::Generated)
                .attempt_files(vec!["adder.py".to_string(), "test_adder.py".to_string()]),
            StateUpdate::phase(Phase::Testing),
        ],
    );

    let generator = ScriptedGenerator::new(Vec::new());
    let mut orchestrator = project.orchestrator(generator.clone(), ScriptedTool::passes_after(0));
    let outcome = orchestrator.run(|_| {}).expect("run");

    assert_eq!(outcome.stop, LoopStop::Success);
    assert!(generator.requests().is_empty());
    assert_eq!(outcome.state.attempt, 0);
}

#[test]
fn interrupted_tests_resume_in_a_new_process() {
    let project = TestProject::new(2).expect("project");
    let generator = ScriptedGenerator::repeating(project_files());
    let tool = ScriptedTool::never_passes().requesting_shutdown(project.shutdown().clone());
    let mut orchestrator = project.orchestrator(generator, tool);

    let outcome = orchestrator.run(|_| {}).expect("first run");
    assert_eq!(outcome.stop, LoopStop::Interrupted);
    assert_eq!(project.read_state().expect("state").phase, Phase::Testing);

    // A new invocation has its own, unset shutdown flag.
    let mut registry = ToolRegistry::new();
    registry
        .register(Box::new(ScriptedTool::passes_after(0)))
        .expect("register");
    let mut resumed = Orchestrator::new(
        StateStore::open(project.state_path()).expect("open"),
        ScriptedGenerator::new(Vec::new()),
        registry,
        WorkspaceWriter::new(project.workspace()),
        TEST_SPEC,
        Shutdown::new(),
        DEFAULT_OUTPUT_LIMIT_BYTES,
    );
    let outcome = resumed.run(|_| {}).expect("resumed run");
    assert_eq!(outcome.stop, LoopStop::Success);
    assert_eq!(outcome.state.attempt, 0);
}

#[test]
fn changed_spec_discards_the_recorded_run() {
    let project = TestProject::new(2).expect("project");
    advance(
        &project,
        vec![
            StateUpdate::phase(Phase::Generating),
            StateUpdate::phase(Phase::Generated).attempt_files(vec!["adder.py".to_string()]),
            StateUpdate::phase(Phase::Testing),
            StateUpdate::phase(Phase::Tested).attempt(1),
        ],
    );
    fs::write(project.spec_path(), "Build a subtractor instead.\n").expect("change spec");

    let started = start_or_resume(
        &project.spec_path(),
        &project.workspace(),
        &project.state_path(),
        &StartOptions {
            max_retries: 4,
            fresh: false,
            clear_workspace: true,
        },
    )
    .expect("start");

    assert!(!started.resumed);
    assert_ne!(started.state.run_id, "run-test");
    let state = project.read_state().expect("state");
    assert_eq!(state.phase, Phase::Init);
    assert_eq!(state.attempt, 0);
    assert_eq!(state.max_retries, 4);
    assert_ne!(state.spec_fingerprint, project.fingerprint());
}

#[test]
fn unchanged_spec_resumes_the_recorded_run() {
    let project = TestProject::new(2).expect("project");
    advance(
        &project,
        vec![
            StateUpdate::phase(Phase::Generating),
            StateUpdate::phase(Phase::Generated).attempt_files(vec!["adder.py".to_string()]),
            StateUpdate::phase(Phase::Testing),
            StateUpdate::phase(Phase::Tested).attempt(1),
        ],
    );

    let started = start_or_resume(
        &project.spec_path(),
        &project.workspace(),
        &project.state_path(),
        &StartOptions {
            max_retries: 9,
            fresh: false,
            clear_workspace: true,
        },
    )
    .expect("start");

    assert!(started.resumed);
    assert_eq!(started.state.run_id, "run-test");
    assert_eq!(started.state.phase, Phase::Tested);
    assert_eq!(started.state.attempt, 1);
    assert_eq!(started.state.max_retries, 2);
}
