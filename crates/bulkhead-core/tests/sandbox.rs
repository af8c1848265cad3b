//! End-to-end spawns through the namespace executor.
//!
//! Hosts without usable namespaces (or containers that refuse the mounts) skip these.

#![cfg(target_os = "linux")]

use bulkhead_core::{
    CancelToken, ErrorKind, ExecutorConfig, HostCapabilities, IsolationLevel, NamespaceExecutor,
    SpawnExecutor, SpawnResult, SpawnSpec, Stage, Strictness,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Host {
    tmp: TempDir,
    executor: NamespaceExecutor,
}

impl Host {
    fn new() -> Option<Self> {
        let caps = HostCapabilities::probe();
        if caps.max_level(false) < IsolationLevel::Filesystem {
            eprintln!("skipping: host offers no filesystem isolation ({caps:?})");
            return None;
        }

        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("work")).unwrap();
        let config = ExecutorConfig::builder()
            .scratch_dir(tmp.path().join("scratch"))
            .grace_period(Duration::from_millis(500))
            .poll_interval(Duration::from_millis(20))
            .drain_timeout(Duration::from_millis(500))
            .build();
        Some(Self {
            tmp,
            executor: NamespaceExecutor::new(config, caps),
        })
    }

    fn host_root(&self) -> PathBuf {
        self.tmp.path().join("work")
    }

    fn spec(&self, argv: &[&str]) -> bulkhead_core::spec::SpawnSpecBuilder {
        SpawnSpec::builder()
            .args(argv.iter().copied())
            .host_root(self.host_root())
            .isolation(IsolationLevel::Full)
            .strictness(Strictness::Downgrade)
            .timeout_secs(5)
    }

    /// Run `spec`, or `None` when the host refused to build the sandbox
    fn run(&self, spec: &SpawnSpec) -> Option<SpawnResult> {
        self.run_with(spec, &CancelToken::new())
    }

    fn run_with(&self, spec: &SpawnSpec, cancel: &CancelToken) -> Option<SpawnResult> {
        match self.executor.execute(spec, cancel) {
            Ok(result) => Some(result),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::IsolationDenied | ErrorKind::IsolationUnavailable
                ) =>
            {
                eprintln!("skipping: sandbox setup refused: {e}");
                None
            }
            Err(e) => panic!("spawn failed: {e}"),
        }
    }

    fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.tmp.path().join("scratch"))
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }
}

/// Live (non-zombie) processes whose command line contains `needle`
fn live_processes(needle: &str) -> usize {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .flatten()
        .filter(|entry| entry.file_name().to_str().is_some_and(|n| n.parse::<u32>().is_ok()))
        .filter_map(|entry| std::fs::read(entry.path().join("cmdline")).ok())
        .filter(|cmdline| String::from_utf8_lossy(cmdline).replace('\0', " ").contains(needle))
        .count()
}

/// Wait briefly for killed processes to disappear, returning how many remain
fn leftovers(needle: &str) -> usize {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let count = live_processes(needle);
        if count == 0 || Instant::now() >= deadline {
            return count;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn copies_an_input_to_a_materialized_output() {
    let Some(host) = Host::new() else { return };
    let src = host.tmp.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("a.txt"), "alpha\n").unwrap();

    let spec = host
        .spec(&["cp", "in/a.txt", "out/a.txt"])
        .input("in/a.txt", src.join("a.txt"))
        .output("out")
        .build()
        .unwrap();
    let Some(result) = host.run(&spec) else { return };

    assert!(result.is_success(), "{}: {}", result.summary(), result.stderr_str());
    assert!(!result.timed_out);
    assert!(result.isolation >= IsolationLevel::Filesystem);
    assert_eq!(
        std::fs::read_to_string(host.host_root().join("out/a.txt")).unwrap(),
        "alpha\n"
    );
    assert!(host.scratch_is_empty());
}

#[test]
fn undeclared_host_files_are_invisible() {
    let Some(host) = Host::new() else { return };
    let secret = host.tmp.path().join("secret.txt");
    std::fs::write(&secret, "do not read").unwrap();
    let secret = secret.to_str().unwrap().to_owned();

    let spec = host.spec(&["cat", &secret]).build().unwrap();
    let Some(result) = host.run(&spec) else { return };

    assert_ne!(result.exit_code, 0);
    assert!(!result.stdout_str().contains("do not read"));
}

#[test]
fn inputs_are_read_only() {
    let Some(host) = Host::new() else { return };
    let src = host.tmp.path().join("input.txt");
    std::fs::write(&src, "original").unwrap();

    let spec = host
        .spec(&["/bin/sh", "-c", "echo changed > in/input.txt"])
        .input("in/input.txt", &src)
        .build()
        .unwrap();
    let Some(result) = host.run(&spec) else { return };

    assert_ne!(result.exit_code, 0);
    assert_eq!(std::fs::read_to_string(&src).unwrap(), "original");
}

#[test]
fn sleeping_action_is_killed_at_the_deadline() {
    let Some(host) = Host::new() else { return };
    let spec = host
        .spec(&["sleep", "60"])
        .timeout(Duration::from_secs(1))
        .build()
        .unwrap();

    let started = Instant::now();
    let Some(result) = host.run(&spec) else { return };

    assert!(result.timed_out);
    assert!(result.signal.is_some());
    assert!(result.wall_time >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
    assert!(host.scratch_is_empty());
}

#[test]
fn missing_program_fails_at_exec() {
    let Some(host) = Host::new() else { return };
    let spec = host.spec(&["/no/such/program"]).build().unwrap();

    match host.executor.execute(&spec, &CancelToken::new()) {
        Err(e) if e.kind() == ErrorKind::SpawnFailed => {
            assert_eq!(e.stage(), Some(Stage::Exec));
            assert_eq!(e.errno(), Some(nix::errno::Errno::ENOENT));
        }
        Err(e) if matches!(e.kind(), ErrorKind::IsolationDenied | ErrorKind::IsolationUnavailable) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(host.scratch_is_empty());
}

#[test]
fn action_sees_the_sandbox_hostname() {
    let Some(host) = Host::new() else { return };
    let spec = host.spec(&["uname", "-n"]).build().unwrap();
    let Some(result) = host.run(&spec) else { return };

    assert!(result.is_success(), "{}", result.stderr_str());
    assert_eq!(result.stdout_str().trim(), "localhost");
}

#[test]
fn action_runs_unprivileged_and_cannot_tune_the_host() {
    let Some(host) = Host::new() else { return };
    // Writes back the value it read, so even a successful write changes nothing
    let script = "id -u; v=$(cat /proc/sys/vm/swappiness 2>/dev/null) \
                  && echo \"$v\" > /proc/sys/vm/swappiness 2>/dev/null && echo WROTE";
    let spec = host.spec(&["/bin/sh", "-c", script]).build().unwrap();
    let Some(result) = host.run(&spec) else { return };

    let stdout = result.stdout_str();
    let uid = stdout.lines().next().unwrap_or_default().trim();
    assert!(!uid.is_empty(), "{}", result.stderr_str());
    assert_ne!(uid, "0", "action kept uid 0");
    assert!(!stdout.contains("WROTE"), "action changed a host sysctl");
}

#[test]
fn background_descendants_die_with_the_action() {
    let Some(host) = Host::new() else { return };
    let spec = host
        .spec(&["/bin/sh", "-c", "sleep 3607 & sleep 3607 & wait"])
        .timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    let Some(result) = host.run(&spec) else { return };

    assert!(result.timed_out);
    assert_eq!(leftovers("sleep 3607"), 0);
    assert!(host.scratch_is_empty());
}

#[test]
fn cancellation_from_another_thread_stops_the_sandbox() {
    let Some(host) = Host::new() else { return };
    let spec = host
        .spec(&["/bin/sh", "-c", "sleep 3608 & wait"])
        .timeout(Duration::from_secs(60))
        .build()
        .unwrap();

    let cancel = CancelToken::new();
    let remote = cancel.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        remote.cancel();
    });
    let started = Instant::now();
    let outcome = host.run_with(&spec, &cancel);
    canceller.join().unwrap();
    let Some(result) = outcome else { return };

    assert!(result.cancelled);
    assert!(!result.timed_out);
    assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    assert_eq!(leftovers("sleep 3608"), 0);
    assert!(host.scratch_is_empty());
}

#[test]
fn spawn_cancelled_up_front_stops_during_setup() {
    let Some(host) = Host::new() else { return };
    let spec = host.spec(&["sleep", "3609"]).build().unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let started = Instant::now();
    let Some(result) = host.run_with(&spec, &cancel) else { return };

    assert!(result.cancelled);
    assert!(!result.is_success());
    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    assert_eq!(leftovers("sleep 3609"), 0);
    assert!(host.scratch_is_empty());
}

#[test]
fn signal_deaths_and_exit_codes_stay_distinct() {
    let Some(host) = Host::new() else { return };

    let spec = host.spec(&["/bin/sh", "-c", "kill -USR1 $$"]).build().unwrap();
    let Some(killed) = host.run(&spec) else { return };
    assert_eq!(killed.signal, Some(libc::SIGUSR1));
    assert_eq!(killed.exit_code, 128 + libc::SIGUSR1);
    assert!(!killed.timed_out);

    let spec = host
        .spec(&["/bin/sh", "-c", &format!("exit {}", 128 + libc::SIGUSR1)])
        .build()
        .unwrap();
    let Some(exited) = host.run(&spec) else { return };
    assert_eq!(exited.signal, None);
    assert_eq!(exited.exit_code, 128 + libc::SIGUSR1);
}
