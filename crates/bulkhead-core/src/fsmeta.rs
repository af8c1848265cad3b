//! Native file metadata queries: stat family with nanosecond timestamps and extended
//! attributes.
//!
//! Every call goes to the kernel; nothing is cached here. Timestamps are kept as
//! whole seconds plus a nanosecond remainder so change detection below one second
//! survives the trip to callers whose own time types are coarser.

use crate::errno::{FsError, FsErrorKind};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Whether a query resolves a trailing symlink (`stat`) or describes the link itself (`lstat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symlinks {
    Follow,
    NoFollow,
}

/// A point in time split into seconds and nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl Timestamp {
    #[must_use]
    pub const fn new(seconds: i64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    #[must_use]
    pub fn to_system_time(self) -> SystemTime {
        let nanos = Duration::from_nanos(u64::from(self.nanos));
        if self.seconds >= 0 {
            UNIX_EPOCH + Duration::from_secs(self.seconds.unsigned_abs()) + nanos
        } else {
            UNIX_EPOCH - Duration::from_secs(self.seconds.unsigned_abs()) + nanos
        }
    }
}

/// Snapshot of one file's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: PathBuf,
    pub size: u64,
    pub mode: u32,
    pub inode: u64,
    pub is_symlink: bool,
    pub is_dir: bool,
    pub accessed: Timestamp,
    pub modified: Timestamp,
    pub changed: Timestamp,
    /// Extended attributes; empty unless requested through [`stat_with_xattrs`].
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl FileStatus {
    fn from_raw(path: PathBuf, st: &libc::stat) -> Self {
        let mode = u32::from(st.st_mode);
        let kind = mode & u32::from(libc::S_IFMT);
        Self {
            path,
            size: u64::try_from(st.st_size).unwrap_or_default(),
            mode,
            inode: st.st_ino,
            is_symlink: kind == u32::from(libc::S_IFLNK),
            is_dir: kind == u32::from(libc::S_IFDIR),
            accessed: timestamp(st.st_atime, st.st_atime_nsec),
            modified: timestamp(st.st_mtime, st.st_mtime_nsec),
            changed: timestamp(st.st_ctime, st.st_ctime_nsec),
            xattrs: BTreeMap::new(),
        }
    }

    /// Permission bits without the file type.
    #[must_use]
    pub const fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

#[allow(clippy::useless_conversion)]
fn timestamp(seconds: libc::time_t, nanos: libc::c_long) -> Timestamp {
    Timestamp {
        seconds: i64::from(seconds),
        nanos: u32::try_from(nanos).unwrap_or_default(),
    }
}

/// Result of an extended attribute lookup. Absence and lack of support are ordinary
/// outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrLookup {
    Value(Vec<u8>),
    Absent,
    Unsupported,
}

impl XattrLookup {
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }
}

fn c_path(path: &Path) -> Result<CString, FsError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| FsError::for_path(Errno::EINVAL, path))
}

/// `stat(2)` or `lstat(2)` depending on `symlinks`.
pub fn stat(path: impl AsRef<Path>, symlinks: Symlinks) -> Result<FileStatus, FsError> {
    let path = path.as_ref();
    let path_c = c_path(path)?;
    let mut st = MaybeUninit::<libc::stat>::uninit();

    // SAFETY: path_c is NUL-terminated and st points to writable storage of the right size
    let ret = unsafe {
        match symlinks {
            Symlinks::Follow => libc::stat(path_c.as_ptr(), st.as_mut_ptr()),
            Symlinks::NoFollow => libc::lstat(path_c.as_ptr(), st.as_mut_ptr()),
        }
    };

    if ret != 0 {
        let err = FsError::last(path);
        tracing::trace!(path = %path.display(), kind = %err.kind(), "stat failed");
        return Err(err);
    }

    // SAFETY: stat returned 0, so the buffer is initialized
    let st = unsafe { st.assume_init() };
    Ok(FileStatus::from_raw(path.to_path_buf(), &st))
}

/// `fstatat(2)` relative to an open directory.
pub fn stat_at(dir: impl AsFd, name: impl AsRef<Path>, symlinks: Symlinks) -> Result<FileStatus, FsError> {
    let name = name.as_ref();
    let name_c = c_path(name)?;
    let flags = match symlinks {
        Symlinks::Follow => 0,
        Symlinks::NoFollow => libc::AT_SYMLINK_NOFOLLOW,
    };
    let mut st = MaybeUninit::<libc::stat>::uninit();

    // SAFETY: the descriptor is borrowed for the duration of the call
    let ret = unsafe {
        libc::fstatat(
            dir.as_fd().as_raw_fd(),
            name_c.as_ptr(),
            st.as_mut_ptr(),
            flags,
        )
    };

    if ret != 0 {
        return Err(FsError::last(name));
    }

    // SAFETY: fstatat returned 0
    let st = unsafe { st.assume_init() };
    Ok(FileStatus::from_raw(name.to_path_buf(), &st))
}

/// Like [`stat`], with every extended attribute loaded into [`FileStatus::xattrs`].
pub fn stat_with_xattrs(path: impl AsRef<Path>, symlinks: Symlinks) -> Result<FileStatus, FsError> {
    let path = path.as_ref();
    let mut status = stat(path, symlinks)?;

    // A symlink's own attributes are only reachable without following it
    let names = match list_xattrs(path, symlinks) {
        Ok(names) => names,
        Err(e) if e.kind() == FsErrorKind::Unsupported => return Ok(status),
        Err(e) => return Err(e),
    };

    for name in names {
        if let XattrLookup::Value(value) = get_xattr(path, &name, symlinks)? {
            status.xattrs.insert(name, value);
        }
    }

    Ok(status)
}

#[cfg(target_os = "linux")]
mod xattr_sys {
    use super::{FsError, Symlinks, XattrLookup, c_path};
    use nix::errno::Errno;
    use std::ffi::CString;
    use std::path::Path;

    fn name_c(path: &Path, name: &str) -> Result<CString, FsError> {
        CString::new(name).map_err(|_| FsError::for_path(Errno::EINVAL, path))
    }

    const fn is_unsupported(errno: Errno) -> bool {
        matches!(errno, Errno::ENOTSUP | Errno::ENOSYS)
    }

    fn raw_get(path: &CString, name: &CString, buf: &mut [u8], symlinks: Symlinks) -> isize {
        let (ptr, len) = if buf.is_empty() {
            (std::ptr::null_mut(), 0)
        } else {
            (buf.as_mut_ptr().cast::<libc::c_void>(), buf.len())
        };
        // SAFETY: ptr/len describe a valid writable buffer, or are null/0 for a size query
        unsafe {
            match symlinks {
                Symlinks::Follow => libc::getxattr(path.as_ptr(), name.as_ptr(), ptr, len),
                Symlinks::NoFollow => libc::lgetxattr(path.as_ptr(), name.as_ptr(), ptr, len),
            }
        }
    }

    pub fn get(path: &Path, name: &str, symlinks: Symlinks) -> Result<XattrLookup, FsError> {
        let path_c = c_path(path)?;
        let name_c = name_c(path, name)?;

        loop {
            let size = raw_get(&path_c, &name_c, &mut [], symlinks);
            if size < 0 {
                return classify_get_error(path);
            }

            let mut buf = vec![0u8; size.unsigned_abs()];
            let read = raw_get(&path_c, &name_c, &mut buf, symlinks);
            if read < 0 {
                // The value grew between the two calls
                if Errno::last() == Errno::ERANGE {
                    continue;
                }
                return classify_get_error(path);
            }

            buf.truncate(read.unsigned_abs());
            return Ok(XattrLookup::Value(buf));
        }
    }

    fn classify_get_error(path: &Path) -> Result<XattrLookup, FsError> {
        match Errno::last() {
            Errno::ENODATA => Ok(XattrLookup::Absent),
            errno if is_unsupported(errno) => Ok(XattrLookup::Unsupported),
            errno => Err(FsError::for_path(errno, path)),
        }
    }

    pub fn set(path: &Path, name: &str, value: &[u8], symlinks: Symlinks) -> Result<(), FsError> {
        let path_c = c_path(path)?;
        let name_c = name_c(path, name)?;
        let ptr = value.as_ptr().cast::<libc::c_void>();

        // SAFETY: value is a valid readable buffer of value.len() bytes
        let ret = unsafe {
            match symlinks {
                Symlinks::Follow => {
                    libc::setxattr(path_c.as_ptr(), name_c.as_ptr(), ptr, value.len(), 0)
                }
                Symlinks::NoFollow => {
                    libc::lsetxattr(path_c.as_ptr(), name_c.as_ptr(), ptr, value.len(), 0)
                }
            }
        };

        if ret != 0 {
            return Err(FsError::last(path));
        }
        Ok(())
    }

    pub fn list(path: &Path, symlinks: Symlinks) -> Result<Vec<String>, FsError> {
        let path_c = c_path(path)?;

        let raw_list = |buf: &mut [u8]| -> isize {
            let (ptr, len) = if buf.is_empty() {
                (std::ptr::null_mut(), 0)
            } else {
                (buf.as_mut_ptr().cast::<libc::c_char>(), buf.len())
            };
            // SAFETY: ptr/len describe a valid writable buffer, or are null/0 for a size query
            unsafe {
                match symlinks {
                    Symlinks::Follow => libc::listxattr(path_c.as_ptr(), ptr, len),
                    Symlinks::NoFollow => libc::llistxattr(path_c.as_ptr(), ptr, len),
                }
            }
        };

        loop {
            let size = raw_list(&mut []);
            if size < 0 {
                return Err(FsError::last(path));
            }
            if size == 0 {
                return Ok(Vec::new());
            }

            let mut buf = vec![0u8; size.unsigned_abs()];
            let read = raw_list(&mut buf);
            if read < 0 {
                if Errno::last() == Errno::ERANGE {
                    continue;
                }
                return Err(FsError::last(path));
            }
            buf.truncate(read.unsigned_abs());

            return Ok(buf
                .split(|b| *b == 0)
                .filter(|name| !name.is_empty())
                .map(|name| String::from_utf8_lossy(name).into_owned())
                .collect());
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod xattr_sys {
    use super::{FsError, Symlinks, XattrLookup};
    use nix::errno::Errno;
    use std::path::Path;

    pub fn get(path: &Path, _name: &str, symlinks: Symlinks) -> Result<XattrLookup, FsError> {
        // Missing files are still reported as such
        super::stat(path, symlinks)?;
        Ok(XattrLookup::Unsupported)
    }

    pub fn set(path: &Path, _name: &str, _value: &[u8], _symlinks: Symlinks) -> Result<(), FsError> {
        Err(FsError::for_path(Errno::ENOSYS, path))
    }

    pub fn list(path: &Path, _symlinks: Symlinks) -> Result<Vec<String>, FsError> {
        Err(FsError::for_path(Errno::ENOSYS, path))
    }
}

/// `getxattr(2)` / `lgetxattr(2)`.
pub fn get_xattr(path: impl AsRef<Path>, name: &str, symlinks: Symlinks) -> Result<XattrLookup, FsError> {
    xattr_sys::get(path.as_ref(), name, symlinks)
}

/// `setxattr(2)` / `lsetxattr(2)`. Fails with [`FsErrorKind::Unsupported`] where the
/// platform or filesystem has no extended attributes.
pub fn set_xattr(path: impl AsRef<Path>, name: &str, value: &[u8], symlinks: Symlinks) -> Result<(), FsError> {
    xattr_sys::set(path.as_ref(), name, value, symlinks)
}

/// `listxattr(2)` / `llistxattr(2)`.
pub fn list_xattrs(path: impl AsRef<Path>, symlinks: Symlinks) -> Result<Vec<String>, FsError> {
    xattr_sys::list(path.as_ref(), symlinks)
}
