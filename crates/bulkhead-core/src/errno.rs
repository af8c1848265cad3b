//! POSIX errno translation for filesystem queries
//!
//! Two message forms are produced: a bare message for programmatic errors and a
//! filename-qualified one, `"<file> (<reason>)"`, for diagnostics shown to users.

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Closed classification of filesystem query failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsErrorKind {
    NotFound,
    PermissionDenied,
    Unsupported,
    Other,
}

impl fmt::Display for FsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "not found",
            Self::PermissionDenied => "permission denied",
            Self::Unsupported => "unsupported",
            Self::Other => "os error",
        })
    }
}

#[must_use]
pub const fn classify(errno: Errno) -> FsErrorKind {
    match errno {
        Errno::ENOENT | Errno::ENOTDIR | Errno::ELOOP | Errno::ENAMETOOLONG => {
            FsErrorKind::NotFound
        }
        Errno::EACCES | Errno::EPERM => FsErrorKind::PermissionDenied,
        Errno::ENOSYS | Errno::EOPNOTSUPP => FsErrorKind::Unsupported,
        #[cfg(not(target_os = "linux"))]
        Errno::ENOTSUP => FsErrorKind::Unsupported,
        _ => FsErrorKind::Other,
    }
}

/// Standard message for an error number.
#[must_use]
pub fn error_message(errno: Errno) -> String {
    errno.desc().to_owned()
}

/// Message naming the file, in the `java.io` style: `"/a/b (No such file or directory)"`.
#[must_use]
pub fn file_error_message(errno: Errno, path: &Path) -> String {
    format!("{} ({})", path.display(), errno.desc())
}

/// A failed filesystem metadata query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct FsError {
    kind: FsErrorKind,
    errno: Errno,
    path: Option<PathBuf>,
}

impl FsError {
    #[must_use]
    pub fn new(errno: Errno) -> Self {
        Self {
            kind: classify(errno),
            errno,
            path: None,
        }
    }

    #[must_use]
    pub fn for_path(errno: Errno, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: classify(errno),
            errno,
            path: Some(path.into()),
        }
    }

    /// Capture `errno` after a failed libc call.
    #[must_use]
    pub fn last(path: &Path) -> Self {
        Self::for_path(Errno::last(), path)
    }

    #[must_use]
    pub const fn kind(&self) -> FsErrorKind {
        self.kind
    }

    #[must_use]
    pub const fn errno(&self) -> Errno {
        self.errno
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, FsErrorKind::NotFound)
    }

    /// Message without the file name.
    #[must_use]
    pub fn bare_message(&self) -> String {
        error_message(self.errno)
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => f.write_str(&file_error_message(self.errno, path)),
            None => f.write_str(&error_message(self.errno)),
        }
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        Self::from_raw_os_error(err.errno as i32)
    }
}
