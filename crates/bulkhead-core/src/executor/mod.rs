//! Spawn executors and the process-wide registry
//!
//! - `namespace` - staged root, Linux namespaces, pivot and privilege drop
//! - `unsandboxed` - runs the command directly; the fallback on hosts without namespaces

#[cfg(target_os = "linux")]
pub mod namespace;
pub mod unsandboxed;

#[cfg(target_os = "linux")]
pub use self::namespace::NamespaceExecutor;
pub use self::unsandboxed::UnsandboxedExecutor;

use crate::cancel::CancelToken;
use crate::capture::CapturedOutput;
use crate::config::ExecutorConfig;
use crate::isolation::HostCapabilities;
use crate::spec::{IsolationLevel, SpawnSpec};
use crate::supervisor::ExitOutcome;
use crate::{Result, SpawnResult};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Something that can run a spawn
pub trait SpawnExecutor: Send + Sync {
    /// Stable name used to select the executor
    fn name(&self) -> &'static str;

    /// Strongest isolation this executor can provide on this host
    fn max_isolation(&self) -> IsolationLevel;

    /// Run one spawn to completion
    fn execute(&self, spec: &SpawnSpec, cancel: &CancelToken) -> Result<SpawnResult>;
}

/// Executors by name, populated once at startup
pub struct ExecutorRegistry {
    executors: BTreeMap<&'static str, Arc<dyn SpawnExecutor>>,
    preferred: &'static str,
}

static GLOBAL: Lazy<ExecutorRegistry> =
    Lazy::new(|| ExecutorRegistry::with_defaults(&ExecutorConfig::default()));

impl ExecutorRegistry {
    /// Registry with the executors available on this platform
    #[must_use]
    pub fn with_defaults(config: &ExecutorConfig) -> Self {
        let mut registry = Self {
            executors: BTreeMap::new(),
            preferred: unsandboxed::NAME,
        };
        registry.register(Arc::new(UnsandboxedExecutor::new(config.clone())));

        #[cfg(target_os = "linux")]
        {
            let sandboxed = NamespaceExecutor::new(config.clone(), HostCapabilities::probe());
            let usable = sandboxed.max_isolation() >= IsolationLevel::Filesystem;
            registry.register(Arc::new(sandboxed));
            if usable {
                registry.preferred = namespace::NAME;
            }
        }

        tracing::debug!(
            executors = ?registry.names(),
            preferred = registry.preferred,
            "executor registry initialized"
        );
        registry
    }

    /// Process-wide registry built from the default configuration
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Add or replace an executor under its own name
    pub fn register(&mut self, executor: Arc<dyn SpawnExecutor>) {
        self.executors.insert(executor.name(), executor);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn SpawnExecutor>> {
        self.executors.get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.executors.keys().copied().collect()
    }

    /// The sandboxing executor when the host supports it, otherwise the fallback
    #[must_use]
    pub fn preferred(&self) -> Arc<dyn SpawnExecutor> {
        match self.executors.get(self.preferred) {
            Some(executor) => Arc::clone(executor),
            None => Arc::new(UnsandboxedExecutor::new(ExecutorConfig::default())),
        }
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.names())
            .field("preferred", &self.preferred)
            .finish()
    }
}

/// Combine the pieces of a finished spawn
pub(crate) fn assemble_result(
    outcome: ExitOutcome,
    stdout: CapturedOutput,
    stderr: CapturedOutput,
    timeout: Duration,
    isolation: IsolationLevel,
) -> SpawnResult {
    let result = SpawnResult {
        exit_code: outcome.exit_code,
        signal: outcome.signal,
        timed_out: outcome.timed_out,
        cancelled: outcome.cancelled,
        stdout: stdout.data,
        stderr: stderr.data,
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        wall_time: outcome.wall_time,
        timeout,
        isolation,
    };

    if result.timed_out {
        tracing::warn!(summary = %result.summary(), "spawn timed out");
    } else {
        tracing::info!(
            exit_code = result.exit_code,
            wall_ms = result.wall_time.as_millis(),
            %isolation,
            "spawn finished"
        );
    }
    result
}
