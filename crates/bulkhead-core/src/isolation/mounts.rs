//! Filesystem mounting and pivot_root inside the sandbox's mount namespace

use super::{StepError, StepResult, check};
use crate::staging::{BindKind, MountPlan, OLD_ROOT};
use nix::errno::Errno;
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Mount work for one execution root
#[derive(Debug)]
pub(crate) struct MountConfig<'a> {
    /// Host path of the staged root
    root: &'a Path,
    plan: &'a MountPlan,
    /// Mount a fresh /proc (only valid with a PID namespace)
    proc: bool,
}

impl<'a> MountConfig<'a> {
    pub(crate) const fn new(root: &'a Path, plan: &'a MountPlan, proc: bool) -> Self {
        Self { root, plan, proc }
    }

    /// Make the staged root the new `/`. The old root stays reachable under `/OLD_ROOT`
    /// until [`Self::apply`] has bound everything it needs from it.
    pub(crate) fn pivot(&self) -> StepResult {
        // Keep every mount below private to this namespace
        mount_raw(None, Path::new("/"), None, libc::MS_REC | libc::MS_PRIVATE)?;

        // pivot_root needs the new root to be a mount point
        mount_bind(self.root, self.root)?;

        let root_c = path_to_cstring(self.root)?;
        // SAFETY: chdir with a valid C string
        check(unsafe { libc::chdir(root_c.as_ptr()) }, || {
            format!("chdir {}", self.root.display())
        })?;

        pivot_root(Path::new("."), Path::new(OLD_ROOT))?;

        // SAFETY: chdir with a static C string
        check(unsafe { libc::chdir(c"/".as_ptr()) }, || "chdir /".into())
    }

    /// Bind system paths, devices and inputs, then detach the old root and make `/`
    /// read-only. Outputs and scratch paths are separate mounts and stay writable.
    pub(crate) fn apply(&self) -> StepResult {
        let old_root = Path::new("/").join(OLD_ROOT);

        for bind in &self.plan.binds {
            let source = old_root.join(bind.source.strip_prefix("/").unwrap_or(&bind.source));
            let target = inside(&bind.target);
            mount_bind(&source, &target)?;
            if bind.kind == BindKind::ReadOnly {
                remount_read_only(&target)?;
            }
        }

        for output in &self.plan.writable {
            let target = inside(output);
            mount_bind(&target, &target)?;
        }

        for scratch in &self.plan.tmpfs {
            mount_tmpfs(&inside(scratch))?;
        }

        if self.proc {
            mount_proc()?;
            protect_proc()?;
        }

        umount2(&old_root, libc::MNT_DETACH)?;
        let old_root_c = path_to_cstring(&old_root)?;
        // SAFETY: rmdir with a valid C string
        check(unsafe { libc::rmdir(old_root_c.as_ptr()) }, || {
            format!("rmdir {}", old_root.display())
        })?;

        remount_read_only(Path::new("/"))
    }
}

fn inside(relative: &Path) -> PathBuf {
    Path::new("/").join(relative)
}

// Helper functions for mount operations

fn path_to_cstring(path: &Path) -> StepResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| StepError::new(Errno::EINVAL, format!("path contains NUL: {}", path.display())))
}

fn mount_raw(
    source: Option<&Path>,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
) -> StepResult {
    mount_with_data(source, target, fstype, flags, None)
}

fn mount_with_data(
    source: Option<&Path>,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> StepResult {
    let source_c = source.map(path_to_cstring).transpose()?;
    let target_c = path_to_cstring(target)?;
    let fstype_c = fstype
        .map(CString::new)
        .transpose()
        .map_err(|_| StepError::new(Errno::EINVAL, "invalid filesystem type"))?;
    let data_c = data
        .map(CString::new)
        .transpose()
        .map_err(|_| StepError::new(Errno::EINVAL, "invalid mount options"))?;

    // SAFETY: mount syscall; every pointer is null or a valid C string
    let ret = unsafe {
        libc::mount(
            source_c.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            target_c.as_ptr(),
            fstype_c.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            flags,
            data_c
                .as_ref()
                .map_or(std::ptr::null(), |s| s.as_ptr().cast::<libc::c_void>()),
        )
    };

    check(ret, || match source {
        Some(src) => format!("mount {} on {}", src.display(), target.display()),
        None => format!("mount {}", target.display()),
    })
}

fn mount_bind(src: &Path, dst: &Path) -> StepResult {
    mount_raw(Some(src), dst, None, libc::MS_BIND | libc::MS_REC)
}

/// Remount a bind read-only, carrying over flags the kernel locks on mounts inherited from
/// a more privileged namespace; dropping them would make the remount fail with EPERM.
fn remount_read_only(path: &Path) -> StepResult {
    let path_c = path_to_cstring(path)?;
    let mut st = MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: statvfs writes into the provided buffer
    check(unsafe { libc::statvfs(path_c.as_ptr(), st.as_mut_ptr()) }, || {
        format!("statvfs {}", path.display())
    })?;
    // SAFETY: statvfs succeeded
    let st = unsafe { st.assume_init() };

    let preserved = [
        (libc::ST_NOSUID, libc::MS_NOSUID),
        (libc::ST_NODEV, libc::MS_NODEV),
        (libc::ST_NOEXEC, libc::MS_NOEXEC),
        (libc::ST_NOATIME, libc::MS_NOATIME),
        (libc::ST_NODIRATIME, libc::MS_NODIRATIME),
        (libc::ST_RELATIME, libc::MS_RELATIME),
    ];
    let mut flags = libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY;
    for (st_flag, ms_flag) in preserved {
        if st.f_flag & st_flag != 0 {
            flags |= ms_flag;
        }
    }

    mount_raw(None, path, None, flags)
}

fn mount_tmpfs(path: &Path) -> StepResult {
    mount_with_data(
        Some(Path::new("tmpfs")),
        path,
        Some("tmpfs"),
        libc::MS_NOSUID | libc::MS_NODEV,
        Some("mode=1777"),
    )
}

fn mount_proc() -> StepResult {
    let proc = Path::new("/proc");
    match std::fs::create_dir(proc) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => {
            let errno = e.raw_os_error().map_or(Errno::EIO, Errno::from_raw);
            return Err(StepError::new(errno, "mkdir /proc"));
        }
    }

    mount_raw(
        Some(Path::new("proc")),
        proc,
        Some("proc"),
        libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
    )
}

/// Kernel tunables under `/proc` that stay read-only for the action
const PROC_READ_ONLY: &[&str] = &["/proc/sys", "/proc/sysrq-trigger"];

/// Self-bind the host-global parts of `/proc` read-only; a fresh procfs in the initial
/// user namespace would otherwise leave sysctls writable by uid 0.
fn protect_proc() -> StepResult {
    for path in PROC_READ_ONLY.iter().map(Path::new) {
        if !path.exists() {
            continue;
        }
        mount_bind(path, path)?;
        remount_read_only(path)?;
    }
    Ok(())
}

fn pivot_root(new_root: &Path, put_old: &Path) -> StepResult {
    let new_root_c = path_to_cstring(new_root)?;
    let put_old_c = path_to_cstring(put_old)?;

    // SAFETY: pivot_root syscall
    let ret = unsafe { libc::syscall(libc::SYS_pivot_root, new_root_c.as_ptr(), put_old_c.as_ptr()) };

    if ret != 0 {
        return Err(StepError::last("pivot_root"));
    }
    Ok(())
}

fn umount2(path: &Path, flags: i32) -> StepResult {
    let path_c = path_to_cstring(path)?;

    // SAFETY: umount2 syscall
    let ret = unsafe { libc::umount2(path_c.as_ptr(), flags) };

    check(ret, || format!("umount2 {}", path.display()))
}
