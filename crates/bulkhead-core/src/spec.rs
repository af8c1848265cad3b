//! Spawn specification: everything one action invocation is allowed to see and do

use crate::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Isolation guarantees, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Runs on the host filesystem view with no namespaces
    None,
    /// Private mount namespace; only the execution root is visible
    Filesystem,
    /// Filesystem isolation plus a private PID namespace
    Process,
    /// Process isolation plus a private network namespace unless networking is allowed
    Full,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Filesystem => "filesystem",
            Self::Process => "process",
            Self::Full => "full",
        })
    }
}

/// What to do when the host cannot provide the requested isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// Fail the spawn with `IsolationUnavailable`
    #[default]
    Strict,
    /// Run at the strongest level the host supports and report it
    Downgrade,
}

/// Identity the action runs as after privileges are dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    /// `nobody`/`nogroup`, used when a root launcher is given no identity
    pub const NOBODY: Self = Self {
        uid: 65534,
        gid: 65534,
    };
}

/// One action invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnSpec {
    /// Program and arguments
    pub argv: Vec<String>,

    /// Complete environment of the action
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory, relative to the execution root
    #[serde(default)]
    pub workdir: PathBuf,

    /// Read-only inputs: relative path inside the root -> absolute host path
    #[serde(default)]
    pub inputs: BTreeMap<PathBuf, PathBuf>,

    /// Writable output directories, relative to the root
    #[serde(default)]
    pub outputs: BTreeSet<PathBuf>,

    /// Writable scratch directories, relative to the root; discarded after the run
    #[serde(default)]
    pub scratch: BTreeSet<PathBuf>,

    /// Host directory that outputs are materialized into and the fallback runs in
    pub host_root: PathBuf,

    /// Wall-clock limit
    #[serde(with = "crate::config::millis")]
    pub timeout: Duration,

    /// Allow network access
    #[serde(default)]
    pub network: bool,

    /// Requested isolation level
    #[serde(default = "default_isolation")]
    pub isolation: IsolationLevel,

    #[serde(default)]
    pub strictness: Strictness,

    /// Identity inside the sandbox; defaults to the caller's own ids
    #[serde(default)]
    pub identity: Option<Identity>,
}

const fn default_isolation() -> IsolationLevel {
    IsolationLevel::Full
}

impl SpawnSpec {
    /// Create a new spec builder
    #[must_use]
    pub fn builder() -> SpawnSpecBuilder {
        SpawnSpecBuilder::default()
    }

    /// Check the spec for malformed paths, environment entries and input/output collisions
    pub fn validate(&self) -> Result<()> {
        let Some(program) = self.argv.first() else {
            return Err(SandboxError::InvalidSpec("empty argv".into()));
        };
        if program.is_empty() {
            return Err(SandboxError::InvalidSpec("empty program name".into()));
        }
        if let Some(arg) = self.argv.iter().find(|a| a.contains('\0')) {
            return Err(SandboxError::InvalidSpec(format!(
                "argument contains NUL: {arg:?}"
            )));
        }

        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(SandboxError::InvalidSpec(format!(
                    "invalid environment variable name: {key:?}"
                )));
            }
            if value.contains('\0') {
                return Err(SandboxError::InvalidSpec(format!(
                    "environment value for {key} contains NUL"
                )));
            }
        }

        if self.timeout.is_zero() {
            return Err(SandboxError::InvalidSpec("timeout must be non-zero".into()));
        }
        if !self.host_root.is_absolute() {
            return Err(SandboxError::InvalidSpec(format!(
                "host root must be absolute: {}",
                self.host_root.display()
            )));
        }

        check_relative(&self.workdir, "working directory", true)?;

        for (target, source) in &self.inputs {
            check_relative(target, "input", false)?;
            if !source.is_absolute() {
                return Err(SandboxError::InvalidSpec(format!(
                    "input source must be absolute: {}",
                    source.display()
                )));
            }
        }
        for output in &self.outputs {
            check_relative(output, "output", false)?;
        }
        for scratch in &self.scratch {
            check_relative(scratch, "scratch path", false)?;
        }

        self.check_collisions()
    }

    fn check_collisions(&self) -> Result<()> {
        let writable = self
            .outputs
            .iter()
            .map(|p| (p, "output"))
            .chain(self.scratch.iter().map(|p| (p, "scratch path")));

        for (path, what) in writable {
            let path = normalize(path);
            for input in self.inputs.keys() {
                let input = normalize(input);
                if path.starts_with(&input) || input.starts_with(&path) {
                    return Err(SandboxError::staging_msg(format!(
                        "{what} {} collides with input {}",
                        path.display(),
                        input.display()
                    )));
                }
            }
        }

        let inputs: Vec<PathBuf> = self.inputs.keys().map(|p| normalize(p)).collect();
        for (i, outer) in inputs.iter().enumerate() {
            let nested = inputs
                .iter()
                .enumerate()
                .find(|&(j, p)| j != i && p.starts_with(outer));
            if let Some((_, inner)) = nested {
                return Err(SandboxError::staging_msg(format!(
                    "input {} is nested inside input {}",
                    inner.display(),
                    outer.display()
                )));
            }
        }

        for scratch in &self.scratch {
            let scratch = normalize(scratch);
            for output in &self.outputs {
                let output = normalize(output);
                if scratch.starts_with(&output) || output.starts_with(&scratch) {
                    return Err(SandboxError::staging_msg(format!(
                        "scratch path {} collides with output {}",
                        scratch.display(),
                        output.display()
                    )));
                }
            }
        }

        Ok(())
    }

    /// The action's environment, with `default_path` added when the spec sets no PATH
    #[must_use]
    pub fn effective_env(&self, default_path: &str) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.entry("PATH".into())
            .or_insert_with(|| default_path.to_owned());
        env
    }
}

/// Drop `.` components so that `a/./b` and `a/b` compare equal.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn check_relative(path: &Path, what: &str, allow_empty: bool) -> Result<()> {
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(SandboxError::InvalidSpec(format!(
                    "{what} must not contain '..': {}",
                    path.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::InvalidSpec(format!(
                    "{what} must be relative: {}",
                    path.display()
                )));
            }
        }
    }

    if !allow_empty && normalize(path).as_os_str().is_empty() {
        return Err(SandboxError::InvalidSpec(format!("{what} path is empty")));
    }
    Ok(())
}

/// Builder for `SpawnSpec`
#[derive(Debug)]
pub struct SpawnSpecBuilder {
    spec: SpawnSpec,
}

impl Default for SpawnSpecBuilder {
    fn default() -> Self {
        Self {
            spec: SpawnSpec {
                argv: Vec::new(),
                env: BTreeMap::new(),
                workdir: PathBuf::new(),
                inputs: BTreeMap::new(),
                outputs: BTreeSet::new(),
                scratch: BTreeSet::new(),
                host_root: PathBuf::new(),
                timeout: Duration::from_secs(300),
                network: false,
                isolation: IsolationLevel::Full,
                strictness: Strictness::Strict,
                identity: None,
            },
        }
    }
}

impl SpawnSpecBuilder {
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.argv.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.argv.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn workdir(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.workdir = path.into();
        self
    }

    #[must_use]
    pub fn input(mut self, target: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        self.spec.inputs.insert(target.into(), source.into());
        self
    }

    #[must_use]
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.outputs.insert(path.into());
        self
    }

    #[must_use]
    pub fn scratch(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.scratch.insert(path.into());
        self
    }

    #[must_use]
    pub fn host_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.host_root = path.into();
        self
    }

    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.spec.timeout = duration;
        self
    }

    #[must_use]
    pub const fn timeout_secs(self, secs: u64) -> Self {
        self.timeout(Duration::from_secs(secs))
    }

    #[must_use]
    pub const fn network(mut self, allow: bool) -> Self {
        self.spec.network = allow;
        self
    }

    #[must_use]
    pub const fn isolation(mut self, level: IsolationLevel) -> Self {
        self.spec.isolation = level;
        self
    }

    #[must_use]
    pub const fn strictness(mut self, strictness: Strictness) -> Self {
        self.spec.strictness = strictness;
        self
    }

    #[must_use]
    pub const fn identity(mut self, uid: u32, gid: u32) -> Self {
        self.spec.identity = Some(Identity { uid, gid });
        self
    }

    /// Validate and return the spec
    pub fn build(self) -> Result<SpawnSpec> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}
