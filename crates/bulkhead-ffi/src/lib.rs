//! C ABI for bulkhead's file metadata queries
//!
//! The build scheduler calls these to decide whether cached work is still valid.
//!
//! # Example (C)
//! ```c
//! #include <bulkhead.h>
//!
//! BulkheadFileStatus st;
//! int err = 0;
//! if (bulkhead_stat("/src/a.txt", &st, &err) != Ok) {
//!     fprintf(stderr, "%s\n", bulkhead_last_error());
//! }
//!
//! uint8_t *value = NULL;
//! size_t len = 0;
//! if (bulkhead_getxattr("/src/a.txt", "user.digest", &value, &len, &err) == Ok) {
//!     bulkhead_bytes_free(value, len);
//! }
//! ```

#![allow(clippy::missing_safety_doc)]

use bulkhead_core::errno::{self, FsError, FsErrorKind};
use bulkhead_core::fsmeta::{self, FileStatus, Symlinks, Timestamp, XattrLookup};
use libc::{c_char, c_int, size_t};
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

/// Outcome of a call
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadStatus {
    Ok = 0,
    /// The path or one of its parents does not exist
    NotFound = 1,
    PermissionDenied = 2,
    /// The filesystem or platform lacks the feature
    Unsupported = 3,
    /// Any other OS error; the errno out-parameter has the details
    OsError = 4,
    /// The extended attribute is not set
    Absent = 5,
    NullPointer = 6,
    InvalidUtf8 = 7,
}

/// Seconds and nanoseconds since the epoch
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkheadTimestamp {
    pub seconds: i64,
    pub nanos: u32,
}

/// Metadata of one file
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkheadFileStatus {
    pub size: u64,
    /// File type and permission bits
    pub mode: u32,
    pub inode: u64,
    pub is_symlink: c_int,
    pub is_dir: c_int,
    pub accessed: BulkheadTimestamp,
    pub modified: BulkheadTimestamp,
    pub changed: BulkheadTimestamp,
}

impl From<Timestamp> for BulkheadTimestamp {
    fn from(ts: Timestamp) -> Self {
        Self {
            seconds: ts.seconds,
            nanos: ts.nanos,
        }
    }
}

impl From<&FileStatus> for BulkheadFileStatus {
    fn from(st: &FileStatus) -> Self {
        Self {
            size: st.size,
            mode: st.mode,
            inode: st.inode,
            is_symlink: c_int::from(st.is_symlink),
            is_dir: c_int::from(st.is_dir),
            accessed: st.accessed.into(),
            modified: st.modified.into(),
            changed: st.changed.into(),
        }
    }
}

// Thread-local error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
    static STRERROR_BUF: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: String) {
    let msg = CString::new(msg).unwrap_or_default();
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg));
}

fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

/// Get the message of the last failed call on this thread
///
/// Returns NULL if the last call succeeded. For OS errors the message names the file:
/// `"/a/b (No such file or directory)"`. The string is valid until the next bulkhead call
/// on this thread.
#[unsafe(no_mangle)]
pub extern "C" fn bulkhead_last_error() -> *const c_char {
    LAST_ERROR.with(|e| e.borrow().as_ref().map_or(ptr::null(), |msg| msg.as_ptr()))
}

/// Standard message for an error number, without a file name
///
/// The string is valid until the next `bulkhead_strerror` call on this thread.
#[unsafe(no_mangle)]
pub extern "C" fn bulkhead_strerror(errnum: c_int) -> *const c_char {
    let msg = errno::error_message(nix::errno::Errno::from_raw(errnum));
    let msg = CString::new(msg).unwrap_or_default();
    STRERROR_BUF.with(|buf| {
        let mut buf = buf.borrow_mut();
        buf.insert(msg).as_ptr()
    })
}

/// Get library version
#[unsafe(no_mangle)]
pub extern "C" fn bulkhead_version() -> *const c_char {
    static VERSION: Lazy<CString> =
        Lazy::new(|| CString::new(env!("CARGO_PKG_VERSION")).unwrap_or_default());
    VERSION.as_ptr()
}

/// `stat(2)` into `out`
///
/// `errno_out` may be NULL; otherwise it receives the raw error number on failure and 0 on
/// success.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bulkhead_stat(
    path: *const c_char,
    out: *mut BulkheadFileStatus,
    errno_out: *mut c_int,
) -> BulkheadStatus {
    // SAFETY: forwarded caller guarantees
    unsafe { stat_impl(path, out, errno_out, Symlinks::Follow) }
}

/// `lstat(2)` into `out`; a symlink is described rather than followed
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bulkhead_lstat(
    path: *const c_char,
    out: *mut BulkheadFileStatus,
    errno_out: *mut c_int,
) -> BulkheadStatus {
    // SAFETY: forwarded caller guarantees
    unsafe { stat_impl(path, out, errno_out, Symlinks::NoFollow) }
}

/// Read extended attribute `name` of `path`
///
/// On `Ok`, `*value_out` points to `*len_out` bytes that the caller must release with
/// `bulkhead_bytes_free`. `Absent` and `Unsupported` are ordinary outcomes and leave the
/// outputs untouched.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bulkhead_getxattr(
    path: *const c_char,
    name: *const c_char,
    value_out: *mut *mut u8,
    len_out: *mut size_t,
    errno_out: *mut c_int,
) -> BulkheadStatus {
    // SAFETY: forwarded caller guarantees
    unsafe { getxattr_impl(path, name, value_out, len_out, errno_out, Symlinks::Follow) }
}

/// Like `bulkhead_getxattr`, reading the attribute of a symlink itself
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bulkhead_lgetxattr(
    path: *const c_char,
    name: *const c_char,
    value_out: *mut *mut u8,
    len_out: *mut size_t,
    errno_out: *mut c_int,
) -> BulkheadStatus {
    // SAFETY: forwarded caller guarantees
    unsafe { getxattr_impl(path, name, value_out, len_out, errno_out, Symlinks::NoFollow) }
}

/// Set extended attribute `name` of `path` to `len` bytes at `value`
///
/// A non-zero `follow` resolves a trailing symlink.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bulkhead_setxattr(
    path: *const c_char,
    name: *const c_char,
    value: *const u8,
    len: size_t,
    follow: c_int,
    errno_out: *mut c_int,
) -> BulkheadStatus {
    // SAFETY: caller guarantees errno_out is NULL or writable
    unsafe { write_errno(errno_out, 0) };

    // SAFETY: caller guarantees path is NULL or a valid C string
    let Some(path) = (unsafe { path_arg(path) }) else {
        return BulkheadStatus::NullPointer;
    };
    // SAFETY: caller guarantees name is NULL or a valid C string
    let name = match unsafe { str_arg(name, "name") } {
        Ok(name) => name,
        Err(status) => return status,
    };
    let value: &[u8] = if len == 0 {
        &[]
    } else if value.is_null() {
        set_last_error("value is null".into());
        return BulkheadStatus::NullPointer;
    } else {
        // SAFETY: caller guarantees value points to len readable bytes
        unsafe { std::slice::from_raw_parts(value, len) }
    };

    let symlinks = if follow == 0 {
        Symlinks::NoFollow
    } else {
        Symlinks::Follow
    };
    match fsmeta::set_xattr(path, name, value, symlinks) {
        Ok(()) => {
            clear_last_error();
            BulkheadStatus::Ok
        }
        // SAFETY: caller guarantees errno_out is NULL or writable
        Err(e) => unsafe { fs_failure(&e, errno_out) },
    }
}

/// Free a buffer returned by `bulkhead_getxattr`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bulkhead_bytes_free(data: *mut u8, len: size_t) {
    if !data.is_null() {
        // SAFETY: data and len come from a boxed slice leaked by bulkhead_getxattr
        drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(data, len)) });
    }
}

unsafe fn stat_impl(
    path: *const c_char,
    out: *mut BulkheadFileStatus,
    errno_out: *mut c_int,
    symlinks: Symlinks,
) -> BulkheadStatus {
    // SAFETY: caller guarantees errno_out is NULL or writable
    unsafe { write_errno(errno_out, 0) };

    if out.is_null() {
        set_last_error("out is null".into());
        return BulkheadStatus::NullPointer;
    }
    // SAFETY: caller guarantees path is NULL or a valid C string
    let Some(path) = (unsafe { path_arg(path) }) else {
        return BulkheadStatus::NullPointer;
    };

    match fsmeta::stat(path, symlinks) {
        Ok(status) => {
            // SAFETY: out is non-null and the caller guarantees it is writable
            unsafe { out.write(BulkheadFileStatus::from(&status)) };
            clear_last_error();
            BulkheadStatus::Ok
        }
        // SAFETY: caller guarantees errno_out is NULL or writable
        Err(e) => unsafe { fs_failure(&e, errno_out) },
    }
}

unsafe fn getxattr_impl(
    path: *const c_char,
    name: *const c_char,
    value_out: *mut *mut u8,
    len_out: *mut size_t,
    errno_out: *mut c_int,
    symlinks: Symlinks,
) -> BulkheadStatus {
    // SAFETY: caller guarantees errno_out is NULL or writable
    unsafe { write_errno(errno_out, 0) };

    if value_out.is_null() || len_out.is_null() {
        set_last_error("value_out and len_out must not be null".into());
        return BulkheadStatus::NullPointer;
    }
    // SAFETY: caller guarantees path is NULL or a valid C string
    let Some(path) = (unsafe { path_arg(path) }) else {
        return BulkheadStatus::NullPointer;
    };
    // SAFETY: caller guarantees name is NULL or a valid C string
    let name = match unsafe { str_arg(name, "name") } {
        Ok(name) => name,
        Err(status) => return status,
    };

    match fsmeta::get_xattr(path, name, symlinks) {
        Ok(XattrLookup::Value(value)) => {
            let len = value.len();
            let data = Box::into_raw(value.into_boxed_slice()).cast::<u8>();
            // SAFETY: both pointers are non-null and the caller guarantees they are writable
            unsafe {
                value_out.write(data);
                len_out.write(len);
            }
            clear_last_error();
            BulkheadStatus::Ok
        }
        Ok(XattrLookup::Absent) => {
            set_last_error(format!("{}: attribute {name} is not set", path.display()));
            BulkheadStatus::Absent
        }
        Ok(XattrLookup::Unsupported) => {
            set_last_error(format!(
                "{}: extended attributes are not supported",
                path.display()
            ));
            BulkheadStatus::Unsupported
        }
        // SAFETY: caller guarantees errno_out is NULL or writable
        Err(e) => unsafe { fs_failure(&e, errno_out) },
    }
}

unsafe fn path_arg<'a>(path: *const c_char) -> Option<&'a Path> {
    if path.is_null() {
        set_last_error("path is null".into());
        return None;
    }
    // SAFETY: caller guarantees path is a valid C string
    let bytes = unsafe { CStr::from_ptr(path) }.to_bytes();
    Some(Path::new(OsStr::from_bytes(bytes)))
}

unsafe fn str_arg<'a>(arg: *const c_char, what: &str) -> Result<&'a str, BulkheadStatus> {
    if arg.is_null() {
        set_last_error(format!("{what} is null"));
        return Err(BulkheadStatus::NullPointer);
    }
    // SAFETY: caller guarantees arg is a valid C string
    unsafe { CStr::from_ptr(arg) }.to_str().map_err(|_| {
        set_last_error(format!("invalid UTF-8 in {what}"));
        BulkheadStatus::InvalidUtf8
    })
}

unsafe fn write_errno(errno_out: *mut c_int, value: c_int) {
    if !errno_out.is_null() {
        // SAFETY: non-null and the caller guarantees it is writable
        unsafe { errno_out.write(value) };
    }
}

unsafe fn fs_failure(error: &FsError, errno_out: *mut c_int) -> BulkheadStatus {
    // SAFETY: caller guarantees errno_out is NULL or writable
    unsafe { write_errno(errno_out, error.errno() as c_int) };
    set_last_error(error.to_string());
    match error.kind() {
        FsErrorKind::NotFound => BulkheadStatus::NotFound,
        FsErrorKind::PermissionDenied => BulkheadStatus::PermissionDenied,
        FsErrorKind::Unsupported => BulkheadStatus::Unsupported,
        FsErrorKind::Other => BulkheadStatus::OsError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn c(path: &Path) -> CString {
        CString::new(path.as_os_str().as_bytes()).unwrap()
    }

    fn last_error() -> Option<String> {
        let msg = bulkhead_last_error();
        if msg.is_null() {
            None
        } else {
            // SAFETY: non-null pointers from bulkhead_last_error are valid C strings
            Some(unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned())
        }
    }

    #[test]
    fn stat_fills_the_status() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let mut st = BulkheadFileStatus::default();
        let mut err = -1;
        let status = unsafe { bulkhead_stat(c(&file).as_ptr(), &mut st, &mut err) };

        assert_eq!(status, BulkheadStatus::Ok);
        assert_eq!(err, 0);
        assert_eq!(st.size, 5);
        assert_eq!(st.is_dir, 0);
        assert!(st.inode > 0);
        assert!(last_error().is_none());
    }

    #[test]
    fn missing_file_reports_not_found_with_the_file_name() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");

        let mut st = BulkheadFileStatus::default();
        let mut err = 0;
        let status = unsafe { bulkhead_stat(c(&missing).as_ptr(), &mut st, &mut err) };

        assert_eq!(status, BulkheadStatus::NotFound);
        assert_eq!(err, libc::ENOENT);
        let msg = last_error().unwrap();
        assert!(msg.starts_with(&missing.display().to_string()), "{msg}");
        assert!(msg.ends_with(')'), "{msg}");
    }

    #[test]
    fn lstat_describes_the_link() {
        let dir = TempDir::new().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("nowhere", &link).unwrap();

        let mut st = BulkheadFileStatus::default();
        let status = unsafe { bulkhead_lstat(c(&link).as_ptr(), &mut st, ptr::null_mut()) };
        assert_eq!(status, BulkheadStatus::Ok);
        assert_eq!(st.is_symlink, 1);

        let status = unsafe { bulkhead_stat(c(&link).as_ptr(), &mut st, ptr::null_mut()) };
        assert_eq!(status, BulkheadStatus::NotFound);
    }

    #[test]
    fn null_arguments_are_rejected() {
        let mut st = BulkheadFileStatus::default();
        let status = unsafe { bulkhead_stat(ptr::null(), &mut st, ptr::null_mut()) };
        assert_eq!(status, BulkheadStatus::NullPointer);
        assert_eq!(last_error().as_deref(), Some("path is null"));
    }

    #[test]
    fn xattr_round_trip_or_unsupported() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();
        let path = c(&file);
        let name = CString::new("user.bulkhead.digest").unwrap();
        let value = b"\x00\x01digest";

        let status = unsafe {
            bulkhead_setxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr(),
                value.len(),
                1,
                ptr::null_mut(),
            )
        };
        if status == BulkheadStatus::Unsupported {
            return;
        }
        assert_eq!(status, BulkheadStatus::Ok);

        let mut data = ptr::null_mut();
        let mut len = 0;
        let status = unsafe {
            bulkhead_getxattr(path.as_ptr(), name.as_ptr(), &mut data, &mut len, ptr::null_mut())
        };
        assert_eq!(status, BulkheadStatus::Ok);
        let read = unsafe { std::slice::from_raw_parts(data, len) }.to_vec();
        unsafe { bulkhead_bytes_free(data, len) };
        assert_eq!(read, value);

        let other = CString::new("user.bulkhead.other").unwrap();
        let status = unsafe {
            bulkhead_getxattr(path.as_ptr(), other.as_ptr(), &mut data, &mut len, ptr::null_mut())
        };
        assert_eq!(status, BulkheadStatus::Absent);
    }

    #[test]
    fn strerror_has_no_file_name() {
        let msg = unsafe { CStr::from_ptr(bulkhead_strerror(libc::ENOENT)) };
        assert_eq!(msg.to_str().unwrap(), "No such file or directory");
        let version = unsafe { CStr::from_ptr(bulkhead_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }
}
