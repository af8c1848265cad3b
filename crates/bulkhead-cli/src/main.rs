//! bulkhead CLI - run one build action in a sandbox, or query file metadata

use anyhow::{Context, bail};
use bulkhead_core::fsmeta::{self, Symlinks, XattrLookup};
use bulkhead_core::{
    CancelToken, ErrorKind, ExecutorConfig, ExecutorRegistry, HostCapabilities, SandboxError,
    Severity, SpawnExecutor, SpawnResult, UnsandboxedExecutor,
};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Exit code when the action hit its deadline
const EXIT_TIMEOUT: u8 = 124;
/// Exit code when the request was unusable or staging or isolation setup failed
const EXIT_SETUP_FAILED: u8 = 125;
/// Exit code when the action's process could not be created
const EXIT_SPAWN_FAILED: u8 = 126;

#[derive(Parser)]
#[command(name = "bulkhead")]
#[command(author, version, about = "Sandboxed execution of build actions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one action described by a JSON spawn spec.
    ///
    /// Exits with the action's own code, or 124 on timeout, 125 when the request or the
    /// sandbox setup failed and 126 when the program could not be started. An action may
    /// exit with those codes itself; use --result to tell the cases apart.
    Run {
        /// Spawn spec (JSON)
        #[arg(short, long)]
        spec: PathBuf,

        /// Executor config (JSON); defaults apply to missing fields
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Executor name (defaults to the best one this host supports)
        #[arg(short, long)]
        executor: Option<String>,

        /// Rerun unsandboxed when isolation is unavailable
        #[arg(long)]
        allow_degraded: bool,

        /// Write the spawn result, or what failed before the action ran, to this file as JSON
        #[arg(long)]
        result: Option<PathBuf>,

        /// Program and arguments, replacing the spec's argv
        #[arg(last = true)]
        argv: Vec<String>,
    },

    /// Print a file's metadata as JSON
    Stat {
        path: PathBuf,

        /// Describe a symlink itself instead of its target
        #[arg(long)]
        no_follow: bool,

        /// Include extended attributes
        #[arg(long)]
        xattrs: bool,
    },

    /// Print one extended attribute
    Getxattr {
        path: PathBuf,
        name: String,

        /// Read the attribute of a symlink itself
        #[arg(long)]
        no_follow: bool,
    },

    /// Print what isolation this host supports
    Probe,

    /// List registered executors
    Executors,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bulkhead=info")),
        )
        .init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Run {
            spec,
            config,
            executor,
            allow_degraded,
            result,
            argv,
        } => Ok(run(
            &RunRequest {
                spec_path: &spec,
                config_path: config.as_deref(),
                executor: executor.as_deref(),
                allow_degraded,
                argv,
            },
            result.as_deref(),
        )),
        Commands::Stat {
            path,
            no_follow,
            xattrs,
        } => stat(&path, symlinks(no_follow), xattrs).map(|()| ExitCode::SUCCESS),
        Commands::Getxattr {
            path,
            name,
            no_follow,
        } => getxattr(&path, &name, symlinks(no_follow)),
        Commands::Probe => probe().map(|()| ExitCode::SUCCESS),
        Commands::Executors => {
            executors();
            Ok(ExitCode::SUCCESS)
        }
    };

    outcome.unwrap_or_else(|e| {
        eprintln!("bulkhead: {e:#}");
        ExitCode::FAILURE
    })
}

const fn symlinks(no_follow: bool) -> Symlinks {
    if no_follow {
        Symlinks::NoFollow
    } else {
        Symlinks::Follow
    }
}

struct RunRequest<'a> {
    spec_path: &'a Path,
    config_path: Option<&'a Path>,
    executor: Option<&'a str>,
    allow_degraded: bool,
    argv: Vec<String>,
}

/// Why `run` produced no spawn result
enum RunFailure {
    /// The sandbox refused or failed to run the action
    Sandbox(SandboxError),
    /// The request itself could not be carried out (unreadable spec, unknown executor)
    Request(anyhow::Error),
}

impl From<SandboxError> for RunFailure {
    fn from(e: SandboxError) -> Self {
        Self::Sandbox(e)
    }
}

impl From<anyhow::Error> for RunFailure {
    fn from(e: anyhow::Error) -> Self {
        Self::Request(e)
    }
}

/// Exit status and machine-readable report of one `run`
struct RunOutcome {
    code: u8,
    report: serde_json::Value,
}

fn run(request: &RunRequest<'_>, result_path: Option<&Path>) -> ExitCode {
    let outcome = match execute(request) {
        Ok(result) => {
            write_streams(&result);
            if result.timed_out || result.cancelled {
                eprintln!("bulkhead: {}", result.summary());
            }
            finished(&result)
        }
        Err(RunFailure::Sandbox(e)) => {
            match e.stage() {
                Some(stage) => eprintln!("bulkhead: {e} (stage: {stage})"),
                None => eprintln!("bulkhead: {e}"),
            }
            sandbox_failed(&e)
        }
        Err(RunFailure::Request(e)) => {
            eprintln!("bulkhead: {e:#}");
            request_failed(&e)
        }
    };

    if let Some(path) = result_path {
        if let Err(e) = write_report(path, &outcome.report) {
            eprintln!("bulkhead: {e:#}");
            return ExitCode::from(EXIT_SETUP_FAILED);
        }
    }
    ExitCode::from(outcome.code)
}

fn execute(request: &RunRequest<'_>) -> Result<SpawnResult, RunFailure> {
    let data = std::fs::read(request.spec_path)
        .with_context(|| format!("cannot read spec {}", request.spec_path.display()))?;
    let mut spec = bulkhead_core::protocol::spec_from_json(&data)?;
    if !request.argv.is_empty() {
        spec.argv.clone_from(&request.argv);
        spec.validate()?;
    }

    let config = match request.config_path {
        Some(path) => ExecutorConfig::from_json_file(path)?,
        None => ExecutorConfig::default(),
    };
    let registry = ExecutorRegistry::with_defaults(&config);
    let executor = match request.executor {
        Some(name) => registry.get(name).with_context(|| {
            format!(
                "unknown executor {name:?}, available: {}",
                registry.names().join(", ")
            )
        })?,
        None => registry.preferred(),
    };

    let cancel = CancelToken::new();
    let _watcher = watch_signals(&cancel)?;

    tracing::info!(executor = executor.name(), argv = ?spec.argv, "running action");
    let result = match executor.execute(&spec, &cancel) {
        Err(e) if request.allow_degraded && e.severity() == Severity::Degradable => {
            tracing::warn!(error = %e, "isolation unavailable, rerunning unsandboxed");
            UnsandboxedExecutor::new(config).execute(&spec, &cancel)
        }
        other => other,
    };
    result.map_err(RunFailure::Sandbox)
}

fn write_streams(result: &SpawnResult) {
    let mut stdout = std::io::stdout().lock();
    drop(stdout.write_all(&result.stdout));
    drop(stdout.flush());
    let mut stderr = std::io::stderr().lock();
    drop(stderr.write_all(&result.stderr));
}

fn finished(result: &SpawnResult) -> RunOutcome {
    let code = if result.timed_out {
        EXIT_TIMEOUT
    } else {
        u8::try_from(result.exit_code).unwrap_or(1)
    };
    RunOutcome {
        code,
        report: serde_json::json!({
            "outcome": "finished",
            "result": result,
        }),
    }
}

fn sandbox_failed(error: &SandboxError) -> RunOutcome {
    let code = match error.kind() {
        ErrorKind::SpawnFailed => EXIT_SPAWN_FAILED,
        _ => EXIT_SETUP_FAILED,
    };
    RunOutcome {
        code,
        report: serde_json::json!({
            "outcome": "failed",
            "kind": error.kind(),
            "stage": error.stage(),
            "errno": error.errno().map(|errno| errno as i32),
            "message": error.to_string(),
        }),
    }
}

fn request_failed(error: &anyhow::Error) -> RunOutcome {
    RunOutcome {
        code: EXIT_SETUP_FAILED,
        report: serde_json::json!({
            "outcome": "failed",
            "kind": "invalid_request",
            "stage": null,
            "errno": null,
            "message": format!("{error:#}"),
        }),
    }
}

fn write_report(path: &Path, report: &serde_json::Value) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(report)?;
    std::fs::write(path, data).with_context(|| format!("cannot write result {}", path.display()))
}

/// Turn SIGINT/SIGTERM into a cancellation of the running spawn
fn watch_signals(cancel: &CancelToken) -> anyhow::Result<SignalWatcher> {
    let flag = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&flag))
            .with_context(|| format!("cannot register handler for signal {signal}"))?;
    }

    let done = Arc::new(AtomicBool::new(false));
    let thread = {
        let cancel = cancel.clone();
        let done = Arc::clone(&done);
        std::thread::Builder::new()
            .name("bulkhead-signals".into())
            .spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    if flag.load(Ordering::Relaxed) {
                        tracing::info!("termination signal received, cancelling");
                        cancel.cancel();
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            })
            .context("cannot start signal watcher")?
    };

    Ok(SignalWatcher {
        done,
        thread: Some(thread),
    })
}

struct SignalWatcher {
    done: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            drop(thread.join());
        }
    }
}

fn stat(path: &Path, symlinks: Symlinks, xattrs: bool) -> anyhow::Result<()> {
    let status = if xattrs {
        fsmeta::stat_with_xattrs(path, symlinks)?
    } else {
        fsmeta::stat(path, symlinks)?
    };
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn getxattr(path: &Path, name: &str, symlinks: Symlinks) -> anyhow::Result<ExitCode> {
    match fsmeta::get_xattr(path, name, symlinks)? {
        XattrLookup::Value(value) => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&value)?;
            stdout.flush()?;
            Ok(ExitCode::SUCCESS)
        }
        XattrLookup::Absent => {
            eprintln!("bulkhead: {}: no attribute {name}", path.display());
            Ok(ExitCode::FAILURE)
        }
        XattrLookup::Unsupported => bail!(
            "{}: extended attributes are not supported here",
            path.display()
        ),
    }
}

fn probe() -> anyhow::Result<()> {
    let caps = HostCapabilities::probe();
    let report = serde_json::json!({
        "capabilities": caps,
        "max_level": caps.max_level(false).to_string(),
        "max_level_with_network": caps.max_level(true).to_string(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn executors() {
    let registry = ExecutorRegistry::global();
    let preferred = registry.preferred();
    for name in registry.names() {
        let Some(executor) = registry.get(name) else {
            continue;
        };
        let marker = if name == preferred.name() { "*" } else { " " };
        println!("{marker} {name:<12} max isolation: {}", executor.max_isolation());
    }
}
