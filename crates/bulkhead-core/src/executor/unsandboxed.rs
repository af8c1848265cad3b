//! Fallback executor: no staging, no namespaces

use super::{SpawnExecutor, assemble_result};
use crate::cancel::CancelToken;
use crate::capture::StreamCapture;
use crate::config::ExecutorConfig;
use crate::spec::{IsolationLevel, SpawnSpec, normalize};
use crate::supervisor::Supervisor;
use crate::{Result, SandboxError, SpawnResult};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Instant;

pub(crate) const NAME: &str = "unsandboxed";

/// Runs actions directly in `host_root/<workdir>` with isolation level `None`.
///
/// The action still gets a cleared environment, its own process group, the deadline and
/// the output limits. Outputs land in place, so nothing is materialized afterwards.
#[derive(Debug, Clone)]
pub struct UnsandboxedExecutor {
    config: ExecutorConfig,
}

impl UnsandboxedExecutor {
    #[must_use]
    pub const fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }
}

impl SpawnExecutor for UnsandboxedExecutor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn max_isolation(&self) -> IsolationLevel {
        IsolationLevel::None
    }

    fn execute(&self, spec: &SpawnSpec, cancel: &CancelToken) -> Result<SpawnResult> {
        spec.validate()?;

        for output in &spec.outputs {
            let dir = spec.host_root.join(normalize(output));
            std::fs::create_dir_all(&dir).map_err(|e| {
                SandboxError::staging(format!("failed to create output {}", dir.display()), e)
            })?;
        }

        let cwd = spec.host_root.join(normalize(&spec.workdir));
        tracing::debug!(cwd = %cwd.display(), "running action without isolation");
        run_direct(&self.config, spec, &cwd, cancel, IsolationLevel::None)
    }
}

/// Spawn `spec` as a child in `cwd` and supervise it to completion
pub(crate) fn run_direct(
    config: &ExecutorConfig,
    spec: &SpawnSpec,
    cwd: &Path,
    cancel: &CancelToken,
    isolation: IsolationLevel,
) -> Result<SpawnResult> {
    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| SandboxError::InvalidSpec("empty argv".into()))?;

    let started = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .env_clear()
        .envs(spec.effective_env(&config.default_path))
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|e| match e.raw_os_error() {
            Some(code) => SandboxError::spawn(Errno::from_raw(code), format!("cannot execute {program}")),
            None => SandboxError::SpawnFailed {
                errno: None,
                message: format!("cannot execute {program}: {e}"),
            },
        })?;

    let pid = Pid::from_raw(
        i32::try_from(child.id())
            .map_err(|_| SandboxError::spawn(Errno::EOVERFLOW, "child pid out of range"))?,
    );
    tracing::debug!(pid = pid.as_raw(), program = %program, "action started");

    let stdout = child.stdout.take().map(|s| StreamCapture::spawn("stdout", s, config.output_limit));
    let stderr = child.stderr.take().map(|s| StreamCapture::spawn("stderr", s, config.output_limit));
    let stdout = stdout.transpose()?;
    let stderr = stderr.transpose()?;

    let outcome = Supervisor::new(config).supervise(pid, started, spec.timeout, cancel)?;

    let finish = |capture: Option<StreamCapture>| {
        capture.map(|c| c.finish(config.drain_timeout)).unwrap_or_default()
    };
    Ok(assemble_result(
        outcome,
        finish(stdout),
        finish(stderr),
        spec.timeout,
        isolation,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config() -> ExecutorConfig {
        ExecutorConfig::builder()
            .grace_period(Duration::from_millis(200))
            .poll_interval(Duration::from_millis(20))
            .drain_timeout(Duration::from_millis(500))
            .build()
    }

    fn sh(dir: &TempDir, script: &str) -> SpawnSpec {
        SpawnSpec::builder()
            .args(["/bin/sh", "-c", script])
            .host_root(dir.path())
            .timeout_secs(10)
            .build()
            .unwrap()
    }

    #[test]
    fn runs_in_host_root_with_only_the_spec_environment() {
        let dir = TempDir::new().unwrap();
        let mut spec = sh(&dir, "echo hello; echo \"[$HOME]\"; pwd; echo oops >&2");
        spec.env.insert("LANG".into(), "C".into());

        let result = UnsandboxedExecutor::new(config())
            .execute(&spec, &CancelToken::new())
            .unwrap();

        assert!(result.is_success(), "{}", result.summary());
        assert_eq!(result.isolation, IsolationLevel::None);
        let stdout = result.stdout_str();
        let mut lines = stdout.lines();
        assert_eq!(lines.next(), Some("hello"));
        assert_eq!(lines.next(), Some("[]"));
        let cwd = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(lines.next().map(Path::new), Some(cwd.as_path()));
        assert_eq!(result.stderr_str(), "oops\n");
    }

    #[test]
    fn creates_declared_outputs_in_place() {
        let dir = TempDir::new().unwrap();
        let mut spec = sh(&dir, "echo built > out/gen/result.txt");
        spec.outputs.insert("out/gen".into());

        let result = UnsandboxedExecutor::new(config())
            .execute(&spec, &CancelToken::new())
            .unwrap();
        assert!(result.is_success(), "{}", result.stderr_str());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/gen/result.txt")).unwrap(),
            "built\n"
        );
    }

    #[test]
    fn missing_program_is_a_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let spec = SpawnSpec::builder()
            .arg("/nonexistent/bulkhead-test-program")
            .host_root(dir.path())
            .build()
            .unwrap();

        let err = UnsandboxedExecutor::new(config())
            .execute(&spec, &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SpawnFailed);
        assert_eq!(err.errno(), Some(Errno::ENOENT));
    }

    #[test]
    fn deadline_ends_a_long_running_action() {
        let dir = TempDir::new().unwrap();
        let mut spec = sh(&dir, "sleep 60");
        spec.timeout = Duration::from_secs(1);

        let started = Instant::now();
        let result = UnsandboxedExecutor::new(config())
            .execute(&spec, &CancelToken::new())
            .unwrap();

        assert!(result.timed_out);
        assert!(!result.is_success());
        assert!(result.wall_time >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.timeout, Duration::from_secs(1));
    }

    #[test]
    fn background_descendants_do_not_outlive_the_spawn() {
        let dir = TempDir::new().unwrap();
        let spec = sh(&dir, "sleep 60 >/dev/null 2>&1 & echo $! > bg.pid");

        let result = UnsandboxedExecutor::new(config())
            .execute(&spec, &CancelToken::new())
            .unwrap();
        assert!(result.is_success());

        let pid: i32 = std::fs::read_to_string(dir.path().join("bg.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        // The orphan is reaped by whoever adopted it; a zombie counts as gone
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let state = std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|s| s.rsplit(')').next().map(|rest| rest.trim_start().starts_with('Z')));
            if state.is_none_or(|zombie| zombie) {
                break;
            }
            assert!(Instant::now() < deadline, "background process {pid} still running");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn output_beyond_the_limit_is_truncated() {
        let dir = TempDir::new().unwrap();
        let spec = sh(&dir, "head -c 100000 /dev/zero");
        let config = ExecutorConfig::builder().output_limit(1024).build();

        let result = UnsandboxedExecutor::new(config)
            .execute(&spec, &CancelToken::new())
            .unwrap();
        assert!(result.stdout_truncated);
        assert!(!result.stderr_truncated);
        assert!(result.stdout.len() < 2048);
    }
}
