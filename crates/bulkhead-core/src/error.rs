//! Error types for bulkhead-core

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Setup stage of one spawn, in the order the stages are entered.
///
/// `Staging` precedes isolation and runs in the supervisor; every later stage runs inside
/// the forked sandbox child. `Exec` is the final hand-off to the action's program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Staging,
    Unconfigured,
    NamespacesEntered,
    RootPivoted,
    Mounted,
    PrivilegesDropped,
    Ready,
    Exec,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Staging => "staging",
            Self::Unconfigured => "unconfigured",
            Self::NamespacesEntered => "namespace setup",
            Self::RootPivoted => "root pivot",
            Self::Mounted => "system mounts",
            Self::PrivilegesDropped => "privilege drop",
            Self::Ready => "ready",
            Self::Exec => "exec",
        };
        f.write_str(name)
    }
}

/// Closed error taxonomy for the spawn path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StagingFailed,
    IsolationUnavailable,
    IsolationDenied,
    SpawnFailed,
    InvalidSpec,
    Os,
}

/// How the caller may react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Isolation could not be provided; the caller may rerun the action unsandboxed.
    Degradable,
    /// The action must be marked failed.
    Fatal,
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("staging failed: {message}{}", os_reason(.source.as_ref()))]
    StagingFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("isolation unavailable during {stage}: {message}")]
    IsolationUnavailable {
        stage: Stage,
        errno: Option<Errno>,
        message: String,
    },

    #[error("isolation denied during {stage}: {message}")]
    IsolationDenied {
        stage: Stage,
        errno: Option<Errno>,
        message: String,
    },

    #[error("spawn failed: {message}")]
    SpawnFailed {
        errno: Option<Errno>,
        message: String,
    },

    #[error("invalid spawn spec: {0}")]
    InvalidSpec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl SandboxError {
    pub(crate) fn staging(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::StagingFailed {
            message: message.into(),
            source: Some(source),
        }
    }

    pub(crate) fn staging_msg(message: impl Into<String>) -> Self {
        Self::StagingFailed {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn spawn(errno: Errno, message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            errno: Some(errno),
            message: format!("{}: {}", message.into(), errno.desc()),
        }
    }

    /// Map a failure reported by the sandbox child onto the taxonomy.
    #[must_use]
    pub fn from_stage_failure(stage: Stage, errno: Errno, what: String) -> Self {
        if matches!((stage, errno), (Stage::Staging, _) | (_, Errno::ENOSPC | Errno::EDQUOT)) {
            return Self::StagingFailed {
                message: what,
                source: Some(std::io::Error::from_raw_os_error(errno as i32)),
            };
        }

        let message = format!("{what}: {}", errno.desc());
        match (stage, errno) {
            (Stage::Exec, _) => Self::SpawnFailed {
                errno: Some(errno),
                message,
            },
            (_, Errno::EPERM | Errno::EACCES) => Self::IsolationDenied {
                stage,
                errno: Some(errno),
                message,
            },
            (_, Errno::ENOSYS | Errno::EINVAL | Errno::EOPNOTSUPP | Errno::EUSERS) => {
                Self::IsolationUnavailable {
                    stage,
                    errno: Some(errno),
                    message,
                }
            }
            _ => Self::IsolationDenied {
                stage,
                errno: Some(errno),
                message,
            },
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::StagingFailed { .. } => ErrorKind::StagingFailed,
            Self::IsolationUnavailable { .. } => ErrorKind::IsolationUnavailable,
            Self::IsolationDenied { .. } => ErrorKind::IsolationDenied,
            Self::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            Self::InvalidSpec(_) => ErrorKind::InvalidSpec,
            Self::Io(_) | Self::Nix(_) => ErrorKind::Os,
        }
    }

    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::IsolationUnavailable { .. } => Severity::Degradable,
            _ => Severity::Fatal,
        }
    }

    /// Stage that failed, when the error comes from the setup sequence.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::StagingFailed { .. } => Some(Stage::Staging),
            Self::IsolationUnavailable { stage, .. } | Self::IsolationDenied { stage, .. } => {
                Some(*stage)
            }
            Self::SpawnFailed { .. } => Some(Stage::Exec),
            _ => None,
        }
    }

    /// Underlying OS error number, if one is known.
    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::IsolationUnavailable { errno, .. }
            | Self::IsolationDenied { errno, .. }
            | Self::SpawnFailed { errno, .. } => *errno,
            Self::StagingFailed { source, .. } => source
                .as_ref()
                .and_then(std::io::Error::raw_os_error)
                .map(Errno::from_raw),
            Self::Io(e) => e.raw_os_error().map(Errno::from_raw),
            Self::Nix(e) => Some(*e),
            Self::InvalidSpec(_) => None,
        }
    }
}

/// `": <os error>"` for a staging failure caused by the OS, empty otherwise
fn os_reason(source: Option<&std::io::Error>) -> String {
    source.map(|e| format!(": {e}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_errors_are_denied_and_fatal() {
        let err = SandboxError::from_stage_failure(
            Stage::RootPivoted,
            Errno::EPERM,
            "bind mount /src".into(),
        );
        assert_eq!(err.kind(), ErrorKind::IsolationDenied);
        assert_eq!(err.severity(), Severity::Fatal);
        assert_eq!(err.stage(), Some(Stage::RootPivoted));
        assert_eq!(err.errno(), Some(Errno::EPERM));
    }

    #[test]
    fn missing_kernel_support_is_degradable() {
        let err = SandboxError::from_stage_failure(
            Stage::NamespacesEntered,
            Errno::ENOSYS,
            "unshare".into(),
        );
        assert_eq!(err.kind(), ErrorKind::IsolationUnavailable);
        assert_eq!(err.severity(), Severity::Degradable);
    }

    #[test]
    fn exec_stage_maps_to_spawn_failure() {
        let err = SandboxError::from_stage_failure(Stage::Exec, Errno::ENOENT, "execve cc".into());
        assert_eq!(err.kind(), ErrorKind::SpawnFailed);
        assert!(err.to_string().contains("execve cc"));
    }

    #[test]
    fn disk_full_is_a_staging_failure() {
        let err = SandboxError::from_stage_failure(Stage::Mounted, Errno::ENOSPC, "tmpfs".into());
        assert_eq!(err.kind(), ErrorKind::StagingFailed);
        assert_eq!(err.errno(), Some(Errno::ENOSPC));
        let msg = err.to_string();
        assert_eq!(msg.matches("No space left on device").count(), 1, "{msg}");
    }

    #[test]
    fn staging_message_carries_the_os_reason() {
        let source = std::io::Error::from_raw_os_error(libc::ENOENT);
        let err = SandboxError::staging("input /nonexistent/x is not available", source);
        let msg = err.to_string();
        assert!(msg.contains("input /nonexistent/x is not available"), "{msg}");
        assert!(msg.contains("No such file or directory"), "{msg}");
        assert_eq!(err.errno(), Some(Errno::ENOENT));
    }

    #[test]
    fn staging_message_without_source_is_unchanged() {
        let err = SandboxError::staging_msg("output out collides with input out");
        assert_eq!(err.to_string(), "staging failed: output out collides with input out");
    }

    #[test]
    fn message_names_the_failed_stage() {
        let err = SandboxError::from_stage_failure(
            Stage::Mounted,
            Errno::EACCES,
            "mount /proc".into(),
        );
        let msg = err.to_string();
        assert!(msg.contains("system mounts"), "{msg}");
        assert!(msg.contains("mount /proc"), "{msg}");
    }
}
