//! The sandbox child.
//!
//! Three processes take part in a sandboxed spawn:
//!
//! 1. the launcher, forked by the supervisor: wires stdio, starts a new session, unshares
//!    the namespaces and writes the id maps, then forks
//! 2. the init, PID 1 of the new PID namespace when there is one: mounts, pivots, drops
//!    privileges, forks the action and reaps everything until the action exits
//! 3. the action, which `execve`s the requested program
//!
//! All three share the launcher's process group, so the supervisor can signal the whole
//! tree at once. Nothing in here logs: the child's stderr belongs to the action.

use super::mounts::MountConfig;
use super::namespace::write_id_maps;
use super::privileges::drop_privileges;
use super::{IsolationPlan, StepError, StepResult, check};
use crate::error::Stage;
use crate::pipe::ReportWriter;
use crate::protocol::{ActionStatus, ChildReport};
use crate::spec::SpawnSpec;
use crate::staging::MountPlan;
use crate::{Result, SandboxError};
use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid};
use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Exit code of a child whose setup failed; the report carries the details
const SETUP_FAILED: i32 = 125;
/// Exit code of an action whose program could not be executed
const EXEC_FAILED: i32 = 127;

/// Program, arguments and environment, converted before forking
#[derive(Debug)]
pub(crate) struct Program {
    argv: Vec<CString>,
    env: Vec<CString>,
    /// Paths tried in order, resolved against the sandbox's view of the filesystem
    candidates: Vec<CString>,
}

impl Program {
    pub(crate) fn new(spec: &SpawnSpec, default_path: &str) -> Result<Self> {
        let invalid = |what: &str| SandboxError::InvalidSpec(format!("{what} contains NUL"));

        let argv = spec
            .argv
            .iter()
            .map(|a| CString::new(a.as_bytes()).map_err(|_| invalid("argument")))
            .collect::<Result<Vec<_>>>()?;

        let env_map = spec.effective_env(default_path);
        let env = env_map
            .iter()
            .map(|(k, v)| CString::new(format!("{k}={v}")).map_err(|_| invalid("environment")))
            .collect::<Result<Vec<_>>>()?;

        let program = spec.argv.first().map_or("", String::as_str);
        let search_path = env_map.get("PATH").map_or(default_path, String::as_str);
        let candidates = resolve_candidates(program, search_path)
            .into_iter()
            .map(|p| CString::new(p).map_err(|_| invalid("program path")))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            argv,
            env,
            candidates,
        })
    }
}

/// `execvp`-style candidate list: a name with a slash is used as is, anything else is
/// looked up in each `PATH` entry (an empty entry means the working directory).
fn resolve_candidates(program: &str, search_path: &str) -> Vec<String> {
    if program.contains('/') {
        return vec![program.to_owned()];
    }
    search_path
        .split(':')
        .map(|dir| {
            if dir.is_empty() {
                format!("./{program}")
            } else {
                format!("{}/{program}", dir.trim_end_matches('/'))
            }
        })
        .collect()
}

/// Everything the child needs, prepared by the supervisor
#[derive(Debug)]
pub(crate) struct SandboxChild<'a> {
    pub plan: &'a IsolationPlan,
    /// Host path of the execution root
    pub root: &'a Path,
    pub mounts: &'a MountPlan,
    pub program: &'a Program,
    /// Working directory as seen inside the sandbox
    pub workdir: PathBuf,
    pub hostname: &'a str,
    pub host_uid: u32,
    pub host_gid: u32,
    /// Pid of the supervisor, to detect it dying before PDEATHSIG was armed
    pub supervisor: Pid,
}

/// Descriptors handed to the child
#[derive(Debug)]
pub(crate) struct ChildStdio {
    pub stdin: File,
    pub stdout: File,
    pub stderr: File,
}

/// Entry point of the launcher process, right after the supervisor's fork
pub(crate) fn launch(
    child: &SandboxChild<'_>,
    stdio: ChildStdio,
    mut report: ReportWriter,
    status: ReportWriter<ActionStatus>,
) -> ! {
    if let Err(e) = prepare_launcher(child, stdio, &[report.as_raw_fd(), status.as_raw_fd()]) {
        fail(&mut report, Stage::Unconfigured, e);
    }

    if let Err(e) = enter_namespaces(child) {
        fail(&mut report, Stage::NamespacesEntered, e);
    }

    // SAFETY: the child only runs the setup sequence below and then execs or exits
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Child) => run_init(child, report, status),
        Ok(ForkResult::Parent { child: init }) => {
            drop((report, status));
            let code = wait_for(init);
            exit(code)
        }
        Err(errno) => fail(
            &mut report,
            Stage::NamespacesEntered,
            StepError::new(errno, "fork sandbox init"),
        ),
    }
}

fn prepare_launcher(child: &SandboxChild<'_>, stdio: ChildStdio, keep: &[RawFd]) -> StepResult {
    for (file, target) in [
        (&stdio.stdin, libc::STDIN_FILENO),
        (&stdio.stdout, libc::STDOUT_FILENO),
        (&stdio.stderr, libc::STDERR_FILENO),
    ] {
        // SAFETY: dup2 onto the standard descriptors
        let ret = unsafe { libc::dup2(file.as_raw_fd(), target) };
        if ret < 0 {
            return Err(StepError::last(format!("dup2 onto fd {target}")));
        }
    }
    drop(stdio);
    close_inherited_fds(keep)?;

    nix::unistd::setsid().map_err(|errno| StepError::new(errno, "setsid"))?;
    set_parent_death_signal()?;
    if nix::unistd::getppid() != child.supervisor {
        return Err(StepError::new(Errno::ESRCH, "supervisor exited during setup"));
    }

    ignore_termination()
}

/// Close every descriptor above stderr except those in `keep`.
///
/// The launcher and init never exec, so close-on-exec does not protect them from holding
/// pipes of concurrent spawns open for the lifetime of the action.
fn close_inherited_fds(keep: &[RawFd]) -> StepResult {
    let ranges = closable_ranges(keep)?;

    let mut close_range_missing = false;
    for (first, last) in ranges {
        if first > last {
            continue;
        }
        // SAFETY: close_range only closes descriptors in the given range
        let ret = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0 as libc::c_uint) };
        if ret != 0 {
            let errno = Errno::last();
            if errno == Errno::ENOSYS {
                close_range_missing = true;
                break;
            }
            return Err(StepError::new(errno, "close_range"));
        }
    }
    if !close_range_missing {
        return Ok(());
    }

    // Kernels before 5.9
    let fds: Vec<RawFd> = std::fs::read_dir("/proc/self/fd")
        .map_err(|e| {
            let errno = e.raw_os_error().map_or(Errno::EIO, Errno::from_raw);
            StepError::new(errno, "read /proc/self/fd")
        })?
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    for fd in fds {
        if fd > 2 && !keep.contains(&fd) {
            // SAFETY: closing an inherited descriptor nothing here uses
            unsafe { libc::close(fd) };
        }
    }
    Ok(())
}

/// Descriptor ranges from 3 upwards that skip every kept descriptor
fn closable_ranges(keep: &[RawFd]) -> StepResult<Vec<(libc::c_uint, libc::c_uint)>> {
    let mut kept = keep
        .iter()
        .map(|&fd| libc::c_uint::try_from(fd))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| StepError::new(Errno::EBADF, "invalid report descriptor"))?;
    kept.sort_unstable();

    let mut ranges = Vec::with_capacity(kept.len() + 1);
    let mut first: libc::c_uint = 3;
    for fd in kept {
        if fd >= first {
            if fd > first {
                ranges.push((first, fd - 1));
            }
            first = fd + 1;
        }
    }
    ranges.push((first, libc::c_uint::MAX));
    Ok(ranges)
}

fn enter_namespaces(child: &SandboxChild<'_>) -> StepResult {
    let namespaces = &child.plan.namespaces;
    namespaces.enter()?;
    if namespaces.user {
        write_id_maps(child.plan.identity, child.host_uid, child.host_gid)?;
    }
    // Credential changes may clear the parent-death signal
    set_parent_death_signal()
}

fn run_init(
    child: &SandboxChild<'_>,
    mut report: ReportWriter,
    mut status: ReportWriter<ActionStatus>,
) -> ! {
    if let Err(e) = set_parent_death_signal() {
        fail(&mut report, Stage::NamespacesEntered, e);
    }

    let mounts = MountConfig::new(child.root, child.mounts, child.plan.namespaces.pid);
    if let Err(e) = mounts.pivot() {
        fail(&mut report, Stage::RootPivoted, e);
    }
    if let Err(e) = mounts.apply().and_then(|()| set_hostname(child)) {
        fail(&mut report, Stage::Mounted, e);
    }
    if let Err(e) = drop_privileges(child.plan.identity, child.plan.switch_ids)
        .and_then(|()| set_parent_death_signal())
    {
        fail(&mut report, Stage::PrivilegesDropped, e);
    }
    if let Err(e) = enter_workdir(&child.workdir) {
        fail(&mut report, Stage::Ready, e);
    }

    // SAFETY: the child only resets signals and execs
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Child) => {
            drop(status);
            exec_action(child.program, report)
        }
        Ok(ForkResult::Parent { child: action }) => {
            drop(report);
            let ended = reap_until(action);
            drop(status.send(&ended));
            exit(ended.exit_code)
        }
        Err(errno) => fail(
            &mut report,
            Stage::Exec,
            StepError::new(errno, "fork action"),
        ),
    }
}

fn set_hostname(child: &SandboxChild<'_>) -> StepResult {
    if !child.plan.namespaces.uts {
        return Ok(());
    }
    nix::unistd::sethostname(child.hostname)
        .map_err(|errno| StepError::new(errno, format!("sethostname({})", child.hostname)))
}

fn enter_workdir(workdir: &Path) -> StepResult {
    nix::unistd::chdir(workdir)
        .map_err(|errno| StepError::new(errno, format!("chdir {}", workdir.display())))
}

fn exec_action(program: &Program, mut report: ReportWriter) -> ! {
    if let Err(e) = restore_signals() {
        fail(&mut report, Stage::Exec, e);
    }

    let mut errno = Errno::ENOENT;
    for candidate in &program.candidates {
        let Err(e) = nix::unistd::execve(candidate, &program.argv, &program.env);
        match e {
            // Keep looking, but remember that something was found and refused
            Errno::EACCES => errno = Errno::EACCES,
            Errno::ENOENT | Errno::ENOTDIR => {}
            other => {
                errno = other;
                break;
            }
        }
    }

    let name = program
        .argv
        .first()
        .map_or_else(String::new, |a| a.to_string_lossy().into_owned());
    drop(report.send(&ChildReport::setup_failed(
        Stage::Exec,
        errno,
        format!("cannot execute {name}"),
    )));
    exit(EXEC_FAILED)
}

/// Reap every child until `action` exits
fn reap_until(action: Pid) -> ActionStatus {
    loop {
        match waitpid(None::<Pid>, None) {
            Ok(WaitStatus::Exited(pid, code)) if pid == action => return ActionStatus::exited(code),
            Ok(WaitStatus::Signaled(pid, signal, _)) if pid == action => {
                return ActionStatus::signaled(signal as i32);
            }
            Ok(_) | Err(Errno::EINTR) => {}
            Err(_) => return ActionStatus::exited(SETUP_FAILED),
        }
    }
}

fn wait_for(pid: Pid) -> i32 {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return ActionStatus::signaled(signal as i32).exit_code;
            }
            Ok(_) | Err(Errno::EINTR) => {}
            Err(_) => return SETUP_FAILED,
        }
    }
}

fn set_parent_death_signal() -> StepResult {
    // SAFETY: prctl with integer arguments
    check(
        unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0) },
        || "prctl(PR_SET_PDEATHSIG)".into(),
    )
}

extern "C" fn ignore_signal(_: libc::c_int) {}

/// PID 1 ignores signals it has no handler for; a no-op handler lets the supervisor's
/// SIGTERM interrupt waits without killing the launcher or init. Handlers reset on exec.
fn ignore_termination() -> StepResult {
    let action = SigAction::new(
        SigHandler::Handler(ignore_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler is async-signal-safe (it does nothing)
    unsafe { nix::sys::signal::sigaction(Signal::SIGTERM, &action) }
        .map(drop)
        .map_err(|errno| StepError::new(errno, "sigaction(SIGTERM)"))
}

/// Give the action default dispositions and an empty signal mask
fn restore_signals() -> StepResult {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in [Signal::SIGPIPE, Signal::SIGTERM, Signal::SIGINT] {
        // SAFETY: installing the default disposition
        unsafe { nix::sys::signal::sigaction(signal, &default) }
            .map_err(|errno| StepError::new(errno, format!("reset {signal}")))?;
    }
    nix::sys::signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(|errno| StepError::new(errno, "sigprocmask"))
}

fn fail(report: &mut ReportWriter, stage: Stage, error: StepError) -> ! {
    drop(report.send(&ChildReport::setup_failed(stage, error.errno, error.message)));
    exit(SETUP_FAILED)
}

fn exit(code: i32) -> ! {
    // SAFETY: leave without running destructors or atexit handlers inherited from the supervisor
    unsafe { libc::_exit(code) }
}
