//! Isolation applier
//!
//! - `probe` - what the host can provide
//! - `namespace` - Linux namespaces (user, pid, mount, net, ipc, uts)
//! - `mounts` - bind mounts, tmpfs, /proc and pivot_root inside the new mount namespace
//! - `privileges` - capability and identity drop
//! - `init` - the sandbox child: setup sequence, action fork and reaping
//!
//! Planning happens in the supervisor before anything is forked. A spawn whose requested
//! level exceeds what the host offers either fails or runs at the weaker level, depending
//! on its [`Strictness`]; setup steps inside the child are never retried.

#[cfg(target_os = "linux")]
pub(crate) mod init;
#[cfg(target_os = "linux")]
mod mounts;
pub mod namespace;
#[cfg(target_os = "linux")]
mod privileges;
pub mod probe;

pub use self::namespace::NamespaceConfig;
pub use self::probe::HostCapabilities;

use crate::error::Stage;
use crate::spec::{Identity, IsolationLevel, SpawnSpec, Strictness};
use crate::{Result, SandboxError};
use nix::errno::Errno;

/// A failed setup step inside the sandbox child
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StepError {
    pub errno: Errno,
    pub message: String,
}

pub(crate) type StepResult<T = ()> = std::result::Result<T, StepError>;

impl StepError {
    pub(crate) fn new(errno: Errno, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }

    /// Capture `errno` of the syscall that just failed
    pub(crate) fn last(message: impl Into<String>) -> Self {
        let errno = Errno::last();
        Self::new(errno, message)
    }
}

/// Turn a libc return code into a step result, reading errno before anything else runs
pub(crate) fn check(ret: libc::c_int, what: impl FnOnce() -> String) -> StepResult {
    if ret == 0 {
        Ok(())
    } else {
        let errno = Errno::last();
        Err(StepError::new(errno, what()))
    }
}

/// Resolved isolation for one spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationPlan {
    /// Level the action will actually run at
    pub level: IsolationLevel,
    /// Level the spec asked for
    pub requested: IsolationLevel,
    pub namespaces: NamespaceConfig,
    /// Identity inside the sandbox
    pub identity: Identity,
    /// Switch uid/gid with setres*id; only for real root outside a user namespace
    pub switch_ids: bool,
}

impl IsolationPlan {
    /// Decide how `spec` runs on a host with `caps`.
    ///
    /// Fails with `IsolationUnavailable` when the requested level is out of reach and the
    /// spec is strict.
    pub fn resolve(spec: &SpawnSpec, caps: &HostCapabilities) -> Result<Self> {
        let requested = spec.isolation;
        let available = caps.max_level(spec.network);
        let level = requested.min(available);

        if level < requested {
            match spec.strictness {
                Strictness::Strict => {
                    return Err(SandboxError::IsolationUnavailable {
                        stage: Stage::Unconfigured,
                        errno: None,
                        message: format!(
                            "requested {requested} isolation but this host supports at most {available}"
                        ),
                    });
                }
                Strictness::Downgrade => {
                    tracing::warn!(
                        %requested,
                        actual = %level,
                        "isolation downgraded to what the host supports"
                    );
                }
            }
        }

        // Root never keeps uid 0 inside the sandbox unless asked to
        let identity = spec.identity.unwrap_or_else(|| {
            if caps.is_root() {
                Identity::NOBODY
            } else {
                Identity {
                    uid: nix::unistd::getuid().as_raw(),
                    gid: nix::unistd::getgid().as_raw(),
                }
            }
        });

        let namespaces = Self::namespaces_for(level, spec.network, caps);
        let switch_ids = namespaces.mount && !namespaces.user && caps.is_root();

        Ok(Self {
            level,
            requested,
            namespaces,
            identity,
            switch_ids,
        })
    }

    fn namespaces_for(level: IsolationLevel, network: bool, caps: &HostCapabilities) -> NamespaceConfig {
        if level == IsolationLevel::None {
            return NamespaceConfig::default();
        }

        NamespaceConfig {
            user: caps.needs_user_ns(),
            mount: true,
            ipc: true,
            uts: true,
            pid: level >= IsolationLevel::Process,
            net: level == IsolationLevel::Full && !network,
        }
    }

    /// Whether the action runs without any namespace
    #[must_use]
    pub const fn is_unsandboxed(&self) -> bool {
        !self.namespaces.mount
    }
}
