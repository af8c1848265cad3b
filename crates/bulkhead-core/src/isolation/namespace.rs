//! Linux namespace isolation

use super::{StepError, StepResult};
use crate::spec::Identity;
use nix::errno::Errno;
#[cfg(target_os = "linux")]
use nix::sched::CloneFlags;
use std::io::Write;

/// Namespaces to unshare for one spawn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct NamespaceConfig {
    /// Create new user namespace
    pub user: bool,
    /// Create new PID namespace
    pub pid: bool,
    /// Create new mount namespace
    pub mount: bool,
    /// Create new network namespace
    pub net: bool,
    /// Create new IPC namespace
    pub ipc: bool,
    /// Create new UTS namespace
    pub uts: bool,
}

impl NamespaceConfig {
    /// Convert to nix CloneFlags
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }

        flags
    }

    /// Enter new namespaces using unshare.
    ///
    /// With a PID namespace only children forked afterwards live inside it.
    #[cfg(target_os = "linux")]
    pub(crate) fn enter(&self) -> StepResult {
        let flags = self.to_clone_flags();
        nix::sched::unshare(flags)
            .map_err(|errno| StepError::new(errno, format!("unshare({flags:?})")))
    }
}

/// Map `inside` onto the caller's own host uid/gid in a freshly unshared user namespace.
///
/// Unprivileged processes may write a single-line map of their own effective ids, provided
/// `setgroups` is denied before `gid_map` is written.
pub(crate) fn write_id_maps(inside: Identity, host_uid: u32, host_gid: u32) -> StepResult {
    write_proc("/proc/self/setgroups", "deny")?;
    write_proc("/proc/self/uid_map", &format!("{} {host_uid} 1\n", inside.uid))?;
    write_proc("/proc/self/gid_map", &format!("{} {host_gid} 1\n", inside.gid))
}

fn write_proc(path: &str, contents: &str) -> StepResult {
    let result = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|mut file| file.write_all(contents.as_bytes()));

    result.map_err(|e| {
        let errno = e.raw_os_error().map_or(Errno::EIO, Errno::from_raw);
        StepError::new(errno, format!("write {path}"))
    })
}
