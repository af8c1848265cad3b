//! Irreversible privilege drop before the action's program runs

use super::{StepError, StepResult, check};
use crate::spec::Identity;
use caps::CapSet;
use nix::errno::Errno;

/// Drop every capability, switch identity when running as real root and set
/// `no_new_privs`. After this returns the process cannot regain privileges.
pub(crate) fn drop_privileges(identity: Identity, switch_ids: bool) -> StepResult {
    // Shrinking the bounding set needs CAP_SETPCAP, so it goes first
    for cap in caps::runtime::thread_all_supported() {
        caps::drop(None, CapSet::Bounding, cap)
            .map_err(|e| StepError::new(last_or(Errno::EPERM), format!("drop {cap} from bounding set: {e}")))?;
    }

    if switch_ids {
        switch_identity(identity)?;
    }

    for set in [
        CapSet::Ambient,
        CapSet::Inheritable,
        CapSet::Effective,
        CapSet::Permitted,
    ] {
        caps::clear(None, set)
            .map_err(|e| StepError::new(last_or(Errno::EPERM), format!("clear {set:?} capabilities: {e}")))?;
    }

    // SAFETY: prctl with PR_SET_NO_NEW_PRIVS takes integer arguments only
    check(
        unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) },
        || "prctl(PR_SET_NO_NEW_PRIVS)".into(),
    )
}

fn switch_identity(identity: Identity) -> StepResult {
    let groups = [identity.gid];
    // SAFETY: setgroups reads exactly one gid from the array
    check(unsafe { libc::setgroups(1, groups.as_ptr()) }, || {
        format!("setgroups([{}])", identity.gid)
    })?;
    // SAFETY: plain id syscalls
    check(
        unsafe { libc::setresgid(identity.gid, identity.gid, identity.gid) },
        || format!("setresgid({})", identity.gid),
    )?;
    // SAFETY: plain id syscalls
    check(
        unsafe { libc::setresuid(identity.uid, identity.uid, identity.uid) },
        || format!("setresuid({})", identity.uid),
    )
}

fn last_or(fallback: Errno) -> Errno {
    match Errno::last() {
        Errno::UnknownErrno => fallback,
        errno => errno,
    }
}
