//! Process-group teardown of verification commands.

#![cfg(unix)]

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use repairloop::io::harness::{HarnessOutcome, HarnessRequest, TestHarness};
use repairloop::io::tools::{CommandTool, Tool};
use repairloop::shutdown::Shutdown;

const TIMEOUT: Duration = Duration::from_secs(1);
const GRACE: Duration = Duration::from_secs(2);

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

/// A pid counts as gone once it no longer exists or is only a zombie
/// waiting for its new parent to reap it.
fn is_running(pid: i32) -> bool {
    if matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH)) {
        return false;
    }
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z"),
        Err(_) => !cfg!(target_os = "linux"),
    }
}

fn wait_until_gone(pid: i32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if !is_running(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    !is_running(pid)
}

fn read_pid(path: &std::path::Path) -> i32 {
    let raw = fs::read_to_string(path).expect("read pid file");
    raw.trim().parse().expect("parse pid")
}

#[test]
fn timeout_kills_the_whole_process_group() {
    let temp = tempfile::tempdir().expect("tempdir");
    let harness = TestHarness::new(Shutdown::new()).with_kill_grace(GRACE);

    let started = Instant::now();
    let run = harness.run(&HarnessRequest {
        command: sh("sleep 100 & echo $! > bg.pid; sleep 100"),
        cwd: temp.path().to_path_buf(),
        timeout: TIMEOUT,
    });
    let elapsed = started.elapsed();

    assert_eq!(run.outcome, HarnessOutcome::TimedOut);
    assert_eq!(run.outcome.exit_code(), -1);
    assert!(run.output.contains("timed out after 1s"), "{}", run.output);
    assert!(
        elapsed < TIMEOUT + GRACE + Duration::from_secs(4),
        "took {elapsed:?}"
    );

    let background = read_pid(&temp.path().join("bg.pid"));
    assert!(
        wait_until_gone(background, Duration::from_secs(2)),
        "background pid {background} survived"
    );
}

#[test]
fn term_ignoring_children_are_killed_after_grace() {
    let temp = tempfile::tempdir().expect("tempdir");
    let harness = TestHarness::new(Shutdown::new()).with_kill_grace(Duration::from_millis(500));

    let started = Instant::now();
    let run = harness.run(&HarnessRequest {
        command: sh("trap '' TERM; sleep 100 & echo $! > bg.pid; while :; do sleep 1; done"),
        cwd: temp.path().to_path_buf(),
        timeout: TIMEOUT,
    });

    assert_eq!(run.outcome, HarnessOutcome::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(8));
    let background = read_pid(&temp.path().join("bg.pid"));
    assert!(wait_until_gone(background, Duration::from_secs(2)));
}

#[test]
fn stragglers_are_swept_after_a_normal_exit() {
    let temp = tempfile::tempdir().expect("tempdir");
    let harness = TestHarness::new(Shutdown::new()).with_kill_grace(GRACE);

    let started = Instant::now();
    let run = harness.run(&HarnessRequest {
        command: sh("sleep 100 & echo $! > bg.pid; exit 3"),
        cwd: temp.path().to_path_buf(),
        timeout: Duration::from_secs(30),
    });

    assert_eq!(run.outcome, HarnessOutcome::Exited { code: 3 });
    assert!(started.elapsed() < Duration::from_secs(10));
    let background = read_pid(&temp.path().join("bg.pid"));
    assert!(wait_until_gone(background, Duration::from_secs(2)));
}

#[test]
fn command_tool_reports_timeouts_as_failures() {
    let temp = tempfile::tempdir().expect("tempdir");
    let tool = CommandTool::new(
        "verify",
        TestHarness::new(Shutdown::new()).with_kill_grace(GRACE),
        sh("sleep 100"),
        temp.path(),
        TIMEOUT,
    );

    let result = tool.run().expect("tool run");
    assert_eq!(result.tool_name, "verify");
    assert!(!result.passed);
    assert_eq!(result.exit_code, -1);
}
