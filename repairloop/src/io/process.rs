//! Running child processes in their own process group, with a deadline,
//! cancellation and bounded output.
//!
//! Every child is the leader of a fresh process group, so on timeout or
//! cancellation the whole tree it spawned is signalled at once. Nothing in the
//! group outlives [`run_command`].

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::shutdown::Shutdown;

/// Granularity of the wait loop; bounds how late a deadline or cancel is noticed.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// How long readers may keep draining after the group is gone.
const DRAIN_WAIT: Duration = Duration::from_secs(2);

/// Budget for one child process.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL when tearing a group down.
    pub kill_grace: Duration,
    /// Per-stream cap; the most recent bytes are kept.
    pub output_limit_bytes: usize,
}

/// How the child came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub termination: Termination,
    /// Tail of stdout, at most `output_limit_bytes`.
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes seen on each stream, including dropped ones.
    pub stdout_total: usize,
    pub stderr_total: usize,
}

impl CommandOutput {
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self.termination {
            Termination::Exited(status) => Some(status),
            Termination::TimedOut | Termination::Cancelled => None,
        }
    }
}

/// Run `cmd` in a new process group and collect its output.
///
/// stdout and stderr are drained on reader threads while the child runs, so a
/// chatty child never blocks on a full pipe. `stdin` is written from its own
/// thread for the same reason. An error means the child could not be started
/// or waited on; every way a started child ends is a [`Termination`].
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    limits: RunLimits,
    shutdown: &Shutdown,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_group(&mut cmd);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let group = ProcessGroup::of(&child);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_reader = TailReader::spawn(stdout, limits.output_limit_bytes);
    let stderr_reader = TailReader::spawn(stderr, limits.output_limit_bytes);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        thread::spawn(move || {
            if let Err(err) = child_stdin.write_all(&input) {
                debug!(err = %err, "child closed stdin early");
            }
        });
    }

    let deadline = Instant::now() + limits.timeout;
    let termination = loop {
        if let Some(status) = child.wait_timeout(POLL_SLICE).context("wait for command")? {
            break Termination::Exited(status);
        }
        if shutdown.is_requested() {
            warn!("shutdown requested, terminating command");
            break Termination::Cancelled;
        }
        if Instant::now() >= deadline {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, terminating process group"
            );
            break Termination::TimedOut;
        }
    };

    match termination {
        Termination::Exited(_) => {
            if group.is_alive() {
                debug!("command left processes behind, sweeping its group");
                group.terminate(None, limits.kill_grace, shutdown)?;
            }
        }
        Termination::TimedOut | Termination::Cancelled => {
            group.terminate(Some(&mut child), limits.kill_grace, shutdown)?;
        }
    }

    let (stdout, stdout_total) = stdout_reader.finish();
    let (stderr, stderr_total) = stderr_reader.finish();
    let limit = limits.output_limit_bytes;
    if stdout_total > limit || stderr_total > limit {
        warn!(stdout_total, stderr_total, "output truncated");
    }

    debug!(?termination, "command finished");
    Ok(CommandOutput {
        termination,
        stdout,
        stderr,
        stdout_total,
        stderr_total,
    })
}

#[cfg(unix)]
fn isolate_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // pgid == child pid
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_group(_cmd: &mut Command) {}

/// The process group led by a spawned child.
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: u32,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    /// SIGTERM the group, SIGKILL whatever is left after `grace` (or as soon
    /// as `shutdown` is forced), then wait until the group is empty. `leader`
    /// is reaped along the way when given.
    #[cfg(unix)]
    fn terminate(
        &self,
        mut leader: Option<&mut Child>,
        grace: Duration,
        shutdown: &Shutdown,
    ) -> Result<()> {
        use nix::sys::signal::Signal;

        self.signal(Signal::SIGTERM);
        let grace_deadline = Instant::now() + grace;
        while Instant::now() < grace_deadline {
            reap(leader.as_deref_mut())?;
            if !self.is_alive() {
                return Ok(());
            }
            if shutdown.is_forced() {
                warn!(pgid = self.pgid, "forced shutdown, cutting kill grace short");
                break;
            }
            thread::sleep(POLL_SLICE);
        }

        warn!(pgid = self.pgid, grace_secs = grace.as_secs(), "process group survived SIGTERM, sending SIGKILL");
        self.signal(Signal::SIGKILL);
        if let Some(child) = leader.as_deref_mut() {
            child.wait().context("wait command after kill")?;
        }
        let kill_deadline = Instant::now() + DRAIN_WAIT;
        while self.is_alive() {
            if Instant::now() >= kill_deadline {
                error!(pgid = self.pgid, "process group still present after SIGKILL");
                break;
            }
            thread::sleep(POLL_SLICE);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(
        &self,
        leader: Option<&mut Child>,
        _grace: Duration,
        _shutdown: &Shutdown,
    ) -> Result<()> {
        if let Some(child) = leader {
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal) {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        match killpg(Pid::from_raw(self.pgid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(pgid = self.pgid, ?signal, err = %err, "failed to signal process group"),
        }
    }

    /// Whether any member of the group still exists (zombies included).
    #[cfg(unix)]
    fn is_alive(&self) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        !matches!(killpg(Pid::from_raw(self.pgid as i32), None), Err(Errno::ESRCH))
    }

    #[cfg(not(unix))]
    fn is_alive(&self) -> bool {
        false
    }
}

// Collect the leader's exit so its zombie stops counting as a group member.
#[cfg(unix)]
fn reap(leader: Option<&mut Child>) -> Result<()> {
    if let Some(child) = leader {
        child.try_wait().context("poll command")?;
    }
    Ok(())
}

/// Most recent bytes of a stream plus the total seen.
#[derive(Debug, Default)]
struct Tail {
    buf: Vec<u8>,
    total: usize,
}

/// Drains one pipe on a background thread, keeping only its tail.
///
/// The buffer is shared rather than returned from the thread: a descendant
/// that escaped the group can hold the pipe open forever, and we still want
/// what was read so far.
struct TailReader {
    tail: Arc<Mutex<Tail>>,
    handle: thread::JoinHandle<()>,
    limit: usize,
}

impl TailReader {
    fn spawn<R: Read + Send + 'static>(mut reader: R, limit: usize) -> Self {
        let tail = Arc::new(Mutex::new(Tail::default()));
        let shared = Arc::clone(&tail);
        let handle = thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                let n = match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(err = %err, "output reader stopped");
                        break;
                    }
                };
                let mut tail = shared.lock().unwrap_or_else(PoisonError::into_inner);
                tail.total += n;
                tail.buf.extend_from_slice(&chunk[..n]);
                // Trim lazily so the copy cost stays amortized.
                if tail.buf.len() > limit.saturating_mul(2).max(limit + chunk.len()) {
                    let excess = tail.buf.len() - limit;
                    tail.buf.drain(..excess);
                }
            }
        });
        Self {
            tail,
            handle,
            limit,
        }
    }

    fn finish(self) -> (Vec<u8>, usize) {
        let deadline = Instant::now() + DRAIN_WAIT;
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.handle.is_finished() {
            if self.handle.join().is_err() {
                warn!("output reader thread panicked");
            }
        } else {
            warn!("output pipe still held open by an escaped process; using partial output");
        }

        let mut tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        let mut buf = std::mem::take(&mut tail.buf);
        if buf.len() > self.limit {
            let excess = buf.len() - self.limit;
            buf.drain(..excess);
        }
        (buf, tail.total)
    }
}
