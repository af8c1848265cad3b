//! Process supervision: deadline, cancellation, termination and reaping

use crate::cancel::CancelToken;
use crate::config::ExecutorConfig;
use crate::result::signal_exit_code;
use crate::{Result, SandboxError};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// How long to sleep between exit checks during the grace period
const GRACE_POLL: Duration = Duration::from_millis(10);

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, `128 + n` when killed by signal `n`
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub wall_time: Duration,
}

/// Why a spawn was stopped before it finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Deadline,
    Cancelled,
}

impl Interruption {
    /// The reason to stop now, if any; the deadline wins over cancellation
    #[must_use]
    pub fn check(started: Instant, timeout: Duration, cancel: &CancelToken) -> Option<Self> {
        if started.elapsed() >= timeout {
            Some(Self::Deadline)
        } else if cancel.is_cancelled() {
            Some(Self::Cancelled)
        } else {
            None
        }
    }
}

/// Waits for one process group leader
#[derive(Debug)]
pub struct Supervisor<'a> {
    config: &'a ExecutorConfig,
}

impl<'a> Supervisor<'a> {
    #[must_use]
    pub const fn new(config: &'a ExecutorConfig) -> Self {
        Self { config }
    }

    /// Wait for `pid`, which must lead its own process group, until it exits, `timeout`
    /// elapses since `started`, or `cancel` fires.
    ///
    /// On timeout or cancellation the group gets SIGTERM, then SIGKILL after the grace
    /// period. Whatever way the leader ends, remaining group members are killed before
    /// this returns.
    pub fn supervise(
        &self,
        pid: Pid,
        started: Instant,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExitOutcome> {
        let deadline = started + timeout;
        let mut timed_out = false;
        let mut cancelled = false;

        let status = loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    let now = Instant::now();
                    if now >= deadline {
                        timed_out = true;
                        tracing::warn!(
                            pid = pid.as_raw(),
                            elapsed_ms = started.elapsed().as_millis(),
                            timeout_ms = timeout.as_millis(),
                            "deadline exceeded, terminating process group"
                        );
                        break self.terminate(pid)?;
                    }
                    if cancel.is_cancelled() {
                        cancelled = true;
                        tracing::info!(pid = pid.as_raw(), "spawn cancelled, terminating process group");
                        break self.terminate(pid)?;
                    }
                    cancel.wait_timeout((deadline - now).min(self.config.poll_interval));
                }
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => break status,
                Ok(_) | Err(Errno::EINTR) => {}
                Err(errno) => {
                    return Err(SandboxError::spawn(errno, format!("waitpid({pid})")));
                }
            }
        };

        let wall_time = started.elapsed();
        sweep_group(pid);

        let (exit_code, signal) = decode_status(status);
        Ok(ExitOutcome {
            exit_code,
            signal,
            timed_out,
            cancelled,
            wall_time,
        })
    }

    /// Stop `pid` and its group before it has finished, e.g. while the sandbox is still
    /// being set up. Same escalation as a deadline hit in [`Self::supervise`].
    pub fn interrupt(&self, pid: Pid, started: Instant, reason: Interruption) -> Result<ExitOutcome> {
        tracing::warn!(pid = pid.as_raw(), ?reason, "spawn interrupted before the action finished");
        let status = self.terminate(pid)?;
        let wall_time = started.elapsed();
        sweep_group(pid);

        let (exit_code, signal) = decode_status(status);
        Ok(ExitOutcome {
            exit_code,
            signal,
            timed_out: reason == Interruption::Deadline,
            cancelled: reason == Interruption::Cancelled,
            wall_time,
        })
    }

    fn terminate(&self, pid: Pid) -> Result<WaitStatus> {
        signal_group(pid, Signal::SIGTERM);

        let grace_end = Instant::now() + self.config.grace_period;
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    let now = Instant::now();
                    if now >= grace_end {
                        break;
                    }
                    std::thread::sleep(GRACE_POLL.min(grace_end - now));
                }
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    return Ok(status);
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(errno) => return Err(SandboxError::spawn(errno, format!("waitpid({pid})"))),
            }
        }

        tracing::debug!(pid = pid.as_raw(), "grace period over, sending SIGKILL");
        signal_group(pid, Signal::SIGKILL);

        loop {
            match waitpid(pid, None) {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    return Ok(status);
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(errno) => return Err(SandboxError::spawn(errno, format!("waitpid({pid})"))),
            }
        }
    }
}

/// Signal the whole group, falling back to the leader alone if the group is gone
fn signal_group(pid: Pid, signal: Signal) {
    if let Err(errno) = killpg(pid, signal) {
        tracing::debug!(pid = pid.as_raw(), %signal, %errno, "group signal failed, signalling leader");
        drop(kill(pid, signal));
    }
}

/// Kill anything left in the group after the leader was reaped
fn sweep_group(pid: Pid) {
    match killpg(pid, Signal::SIGKILL) {
        Ok(()) => tracing::debug!(pid = pid.as_raw(), "killed leftover processes in group"),
        Err(Errno::ESRCH) => {}
        Err(errno) => tracing::warn!(pid = pid.as_raw(), %errno, "failed to sweep process group"),
    }
}

fn decode_status(status: WaitStatus) -> (i32, Option<i32>) {
    match status {
        WaitStatus::Exited(_, code) => (code, None),
        WaitStatus::Signaled(_, signal, _) => {
            let signal = signal as i32;
            (signal_exit_code(signal), Some(signal))
        }
        // Only terminal statuses reach here
        _ => (-1, None),
    }
}
