//! Executor configuration
//!
//! One `ExecutorConfig` value is built at startup and passed to every executor; there
//! is no process-wide mutable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration shared by all spawns of one executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Directory under which per-spawn execution roots are created
    pub scratch_dir: PathBuf,

    /// Host system paths exposed read-only inside the execution root
    pub system_paths: Vec<PathBuf>,

    /// Device nodes bound into `/dev` inside the execution root
    pub devices: Vec<PathBuf>,

    /// Maximum bytes kept per output stream
    pub output_limit: usize,

    /// Time between SIGTERM and SIGKILL when terminating a spawn
    #[serde(with = "millis")]
    pub grace_period: Duration,

    /// Upper bound on how long the supervisor sleeps between exit checks
    #[serde(with = "millis")]
    pub poll_interval: Duration,

    /// How long to wait for output pipes to close after the process exits
    #[serde(with = "millis")]
    pub drain_timeout: Duration,

    /// Leave the execution root on disk when a spawn fails
    pub keep_failed_roots: bool,

    /// PATH given to actions whose environment does not set one
    pub default_path: String,

    /// Hostname inside the UTS namespace
    pub hostname: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            system_paths: ["/bin", "/sbin", "/usr", "/lib", "/lib32", "/lib64"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            devices: ["/dev/null", "/dev/zero", "/dev/random", "/dev/urandom"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            output_limit: 8 * 1024 * 1024, // 8MB
            grace_period: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(2),
            keep_failed_roots: false,
            default_path: "/bin:/usr/bin".into(),
            hostname: "localhost".into(),
        }
    }
}

impl ExecutorConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> ExecutorConfigBuilder {
        ExecutorConfigBuilder::default()
    }

    /// Load a config from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> crate::Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| {
            crate::SandboxError::InvalidSpec(format!(
                "invalid executor config {}: {e}",
                path.display()
            ))
        })
    }
}

/// Builder for `ExecutorConfig`
#[derive(Debug, Default)]
pub struct ExecutorConfigBuilder {
    config: ExecutorConfig,
}

impl ExecutorConfigBuilder {
    #[must_use]
    pub fn scratch_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.scratch_dir = path.into();
        self
    }

    #[must_use]
    pub fn system_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.system_paths.push(path.into());
        self
    }

    #[must_use]
    pub fn system_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.config.system_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn output_limit(mut self, bytes: usize) -> Self {
        self.config.output_limit = bytes;
        self
    }

    #[must_use]
    pub const fn grace_period(mut self, duration: Duration) -> Self {
        self.config.grace_period = duration;
        self
    }

    #[must_use]
    pub const fn poll_interval(mut self, duration: Duration) -> Self {
        self.config.poll_interval = duration;
        self
    }

    #[must_use]
    pub const fn drain_timeout(mut self, duration: Duration) -> Self {
        self.config.drain_timeout = duration;
        self
    }

    #[must_use]
    pub const fn keep_failed_roots(mut self, keep: bool) -> Self {
        self.config.keep_failed_roots = keep;
        self
    }

    #[must_use]
    pub fn default_path(mut self, path: impl Into<String>) -> Self {
        self.config.default_path = path.into();
        self
    }

    #[must_use]
    pub fn hostname(mut self, name: impl Into<String>) -> Self {
        self.config.hostname = name.into();
        self
    }

    #[must_use]
    pub fn build(self) -> ExecutorConfig {
        self.config
    }
}

/// Get default scratch directory from BULKHEAD_SCRATCH env var or the temp dir
///
/// Returns:
/// - `$BULKHEAD_SCRATCH` if set
/// - `$TMPDIR/bulkhead` otherwise
pub fn default_scratch_dir() -> PathBuf {
    std::env::var("BULKHEAD_SCRATCH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("bulkhead"))
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = ExecutorConfig::builder()
            .scratch_dir("/var/tmp/bh")
            .output_limit(1024)
            .grace_period(Duration::from_millis(250))
            .keep_failed_roots(true)
            .build();

        assert_eq!(config.scratch_dir, PathBuf::from("/var/tmp/bh"));
        assert_eq!(config.output_limit, 1024);
        assert_eq!(config.grace_period, Duration::from_millis(250));
        assert!(config.keep_failed_roots);
        assert_eq!(config.default_path, "/bin:/usr/bin");
    }

    #[test]
    fn partial_json_takes_defaults() {
        let config: ExecutorConfig =
            serde_json::from_str(r#"{"grace_period": 300, "output_limit": 64}"#).unwrap();
        assert_eq!(config.grace_period, Duration::from_millis(300));
        assert_eq!(config.output_limit, 64);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert!(config.system_paths.contains(&PathBuf::from("/usr")));
    }

    #[test]
    fn json_round_trips_durations_as_millis() {
        let config = ExecutorConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["grace_period"], 1000);
        assert_eq!(json["poll_interval"], 50);
    }
}
