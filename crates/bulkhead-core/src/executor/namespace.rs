//! Sandboxed executor built on Linux namespaces

use super::unsandboxed::run_direct;
use super::{SpawnExecutor, assemble_result};
use crate::cancel::CancelToken;
use crate::capture::StreamCapture;
use crate::config::ExecutorConfig;
use crate::isolation::init::{self, ChildStdio, Program, SandboxChild};
use crate::isolation::{HostCapabilities, IsolationPlan};
use crate::pipe::{ReportReader, create_pipe, report_channel};
use crate::protocol::{ActionStatus, ChildReport};
use crate::spec::{IsolationLevel, SpawnSpec, normalize};
use crate::staging::{ExecutionRoot, ExecutionRootBuilder, StagingMode};
use crate::supervisor::{ExitOutcome, Interruption, Supervisor};
use crate::{Result, SandboxError, SpawnResult};
use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid};
use std::fs::File;
use std::path::Path;
use std::time::{Duration, Instant};

pub(crate) const NAME: &str = "namespace";

/// Where the sandbox setup ended up
#[derive(Debug)]
enum Setup {
    /// The action's program is running
    Running,
    Failed(ChildReport),
    /// Deadline or cancellation hit before the action started
    Interrupted(Interruption),
}

/// Stages a private root, enters namespaces, pivots into the root, drops privileges and
/// supervises the action; declared outputs are moved back to the host afterwards.
#[derive(Debug, Clone)]
pub struct NamespaceExecutor {
    config: ExecutorConfig,
    caps: HostCapabilities,
}

impl NamespaceExecutor {
    #[must_use]
    pub const fn new(config: ExecutorConfig, caps: HostCapabilities) -> Self {
        Self { config, caps }
    }

    /// What the host offered when this executor was created
    #[must_use]
    pub const fn capabilities(&self) -> &HostCapabilities {
        &self.caps
    }

    fn run_sandboxed(
        &self,
        spec: &SpawnSpec,
        plan: &IsolationPlan,
        root: &ExecutionRoot,
        cancel: &CancelToken,
    ) -> Result<SpawnResult> {
        let program = Program::new(spec, &self.config.default_path)?;
        let (stdout_r, stdout_w) = create_pipe()?;
        let (stderr_r, stderr_w) = create_pipe()?;
        let (mut report_r, report_w) = report_channel::<ChildReport>()?;
        let (mut status_r, status_w) = report_channel::<ActionStatus>()?;
        let stdin = File::open("/dev/null")?;

        let child = SandboxChild {
            plan,
            root: root.path(),
            mounts: root.mount_plan(),
            program: &program,
            workdir: Path::new("/").join(normalize(&spec.workdir)),
            hostname: &self.config.hostname,
            host_uid: nix::unistd::geteuid().as_raw(),
            host_gid: nix::unistd::getegid().as_raw(),
            supervisor: nix::unistd::getpid(),
        };

        let started = Instant::now();
        // SAFETY: the child only runs the setup sequence in `init` and then execs or
        // exits; everything it needs was allocated above
        let pid = match unsafe { nix::unistd::fork() } {
            Ok(ForkResult::Child) => init::launch(
                &child,
                ChildStdio {
                    stdin,
                    stdout: stdout_w,
                    stderr: stderr_w,
                },
                report_w,
                status_w,
            ),
            Ok(ForkResult::Parent { child: launcher }) => launcher,
            Err(errno) => return Err(SandboxError::spawn(errno, "fork sandbox launcher")),
        };
        drop((stdin, stdout_w, stderr_w, report_w, status_w));

        tracing::debug!(
            pid = pid.as_raw(),
            level = %plan.level,
            namespaces = ?plan.namespaces,
            "sandbox launcher started"
        );

        let stdout = StreamCapture::spawn("stdout", stdout_r, self.config.output_limit);
        let stderr = StreamCapture::spawn("stderr", stderr_r, self.config.output_limit);
        let (stdout, stderr) = match (stdout, stderr) {
            (Ok(out), Ok(err)) => (out, err),
            (Err(e), _) | (_, Err(e)) => {
                drop(nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL));
                reap(pid);
                return Err(e.into());
            }
        };

        let supervisor = Supervisor::new(&self.config);
        let setup = match self.await_setup(&mut report_r, started, spec.timeout, cancel) {
            Ok(setup) => setup,
            Err(e) => {
                drop(nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL));
                reap(pid);
                return Err(e);
            }
        };

        let outcome = match setup {
            Setup::Failed(report) => {
                reap(pid);
                let stderr = stderr.finish(self.config.drain_timeout);
                drop(stdout.finish(self.config.drain_timeout));
                let err = report.into_error();
                tracing::warn!(
                    error = %err,
                    stage = ?err.stage(),
                    stderr = %String::from_utf8_lossy(&stderr.data),
                    "sandbox setup failed"
                );
                return Err(err);
            }
            Setup::Interrupted(reason) => supervisor.interrupt(pid, started, reason)?,
            Setup::Running => {
                tracing::debug!(pid = pid.as_raw(), "action running");
                let outcome = supervisor.supervise(pid, started, spec.timeout, cancel)?;
                let status = read_action_status(&mut status_r, self.config.drain_timeout);
                apply_action_status(outcome, status)
            }
        };

        Ok(assemble_result(
            outcome,
            stdout.finish(self.config.drain_timeout),
            stderr.finish(self.config.drain_timeout),
            spec.timeout,
            plan.level,
        ))
    }

    /// Wait for the setup report without outliving the deadline or a cancellation.
    ///
    /// A hung setup step (a bind from an unresponsive network mount, say) would otherwise
    /// block the spawn forever.
    fn await_setup(
        &self,
        report_r: &mut ReportReader,
        started: Instant,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Setup> {
        loop {
            if let Some(reason) = Interruption::check(started, timeout, cancel) {
                return Ok(Setup::Interrupted(reason));
            }
            let remaining = timeout.saturating_sub(started.elapsed());
            if report_r.poll(remaining.min(self.config.poll_interval))? {
                return Ok(match report_r.recv()? {
                    Some(report) => Setup::Failed(report),
                    None => Setup::Running,
                });
            }
        }
    }

    /// Materialize outputs of a finished run and release the root
    fn finish(&self, mut root: ExecutionRoot, result: Result<SpawnResult>) -> Result<SpawnResult> {
        let result = result.and_then(|result| {
            if result.timed_out || result.cancelled {
                tracing::debug!("skipping output materialization for interrupted spawn");
            } else {
                root.materialize_outputs()?;
            }
            Ok(result)
        });

        let failed = !result.as_ref().is_ok_and(SpawnResult::is_success);
        if failed && self.config.keep_failed_roots {
            root.keep();
        } else if let Err(e) = root.teardown() {
            tracing::warn!(error = %e, "failed to remove execution root");
        }
        result
    }
}

impl SpawnExecutor for NamespaceExecutor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn max_isolation(&self) -> IsolationLevel {
        self.caps.max_level(false)
    }

    fn execute(&self, spec: &SpawnSpec, cancel: &CancelToken) -> Result<SpawnResult> {
        spec.validate()?;
        let plan = IsolationPlan::resolve(spec, &self.caps)?;

        if plan.is_unsandboxed() {
            // Nothing to isolate with: run a private copy of the inputs in place
            let root = ExecutionRootBuilder::new(&self.config).stage(spec, StagingMode::Copy)?;
            let cwd = root.path().join(normalize(&spec.workdir));
            let result = run_direct(&self.config, spec, &cwd, cancel, plan.level);
            return self.finish(root, result);
        }

        let mut builder = ExecutionRootBuilder::new(&self.config);
        if plan.switch_ids {
            builder = builder.owner(plan.identity);
        }
        let root = builder.stage(spec, StagingMode::Bind)?;

        let result = self.run_sandboxed(spec, &plan, &root, cancel);
        self.finish(root, result)
    }
}

/// The init's report of how the action ended. Missing when the init itself was killed,
/// e.g. by SIGKILL after the grace period.
fn read_action_status(
    status_r: &mut ReportReader<ActionStatus>,
    wait: Duration,
) -> Option<ActionStatus> {
    match status_r.poll(wait).and_then(|ready| {
        if ready {
            status_r.recv()
        } else {
            Ok(None)
        }
    }) {
        Ok(status) => status,
        Err(e) => {
            tracing::debug!(error = %e, "no exit status from the sandbox init");
            None
        }
    }
}

/// The launcher exits with the action's status folded into `128 + n`; the init's report
/// says whether that was a signal or a plain exit code.
fn apply_action_status(mut outcome: ExitOutcome, status: Option<ActionStatus>) -> ExitOutcome {
    if let Some(status) = status {
        outcome.exit_code = status.exit_code;
        outcome.signal = status.signal;
    }
    outcome
}

fn reap(pid: Pid) {
    while let Err(Errno::EINTR) = waitpid(pid, None) {}
}
