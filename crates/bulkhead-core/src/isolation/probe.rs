//! Host capability detection

use crate::spec::IsolationLevel;
use serde::Serialize;
use std::path::Path;

/// What the host kernel and the current credentials allow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct HostCapabilities {
    /// Effective uid of this process
    pub euid: u32,
    pub mount_ns: bool,
    pub pid_ns: bool,
    pub net_ns: bool,
    pub user_ns: bool,
    pub ipc_ns: bool,
    pub uts_ns: bool,
    /// Unprivileged processes may create user namespaces
    pub unprivileged_userns: bool,
}

impl HostCapabilities {
    /// Inspect `/proc` and the user-namespace sysctls
    #[must_use]
    pub fn probe() -> Self {
        if !cfg!(target_os = "linux") {
            return Self::unsupported();
        }

        let ns = |name: &str| Path::new("/proc/self/ns").join(name).exists();
        let caps = Self {
            euid: nix::unistd::geteuid().as_raw(),
            mount_ns: ns("mnt"),
            pid_ns: ns("pid"),
            net_ns: ns("net"),
            user_ns: ns("user"),
            ipc_ns: ns("ipc"),
            uts_ns: ns("uts"),
            unprivileged_userns: unprivileged_userns_allowed(),
        };

        tracing::debug!(
            euid = caps.euid,
            mount = caps.mount_ns,
            pid = caps.pid_ns,
            net = caps.net_ns,
            user = caps.user_ns,
            unprivileged_userns = caps.unprivileged_userns,
            "host capabilities probed"
        );
        caps
    }

    /// A host with no namespace support at all
    #[must_use]
    pub fn unsupported() -> Self {
        Self {
            euid: nix::unistd::geteuid().as_raw(),
            mount_ns: false,
            pid_ns: false,
            net_ns: false,
            user_ns: false,
            ipc_ns: false,
            uts_ns: false,
            unprivileged_userns: false,
        }
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.euid == 0
    }

    /// A user namespace is needed to gain mount privileges when not root
    #[must_use]
    pub const fn needs_user_ns(&self) -> bool {
        !self.is_root()
    }

    /// Whether a private mount namespace can be created at all
    #[must_use]
    pub const fn can_isolate_filesystem(&self) -> bool {
        self.mount_ns
            && self.ipc_ns
            && self.uts_ns
            && (self.is_root() || (self.user_ns && self.unprivileged_userns))
    }

    /// Strongest level this host can provide to a spawn with the given network flag
    #[must_use]
    pub const fn max_level(&self, network: bool) -> IsolationLevel {
        if !self.can_isolate_filesystem() {
            IsolationLevel::None
        } else if !self.pid_ns {
            IsolationLevel::Filesystem
        } else if !network && !self.net_ns {
            IsolationLevel::Process
        } else {
            IsolationLevel::Full
        }
    }
}

fn unprivileged_userns_allowed() -> bool {
    // Debian-style switch; absent on mainline kernels
    if read_sysctl("/proc/sys/kernel/unprivileged_userns_clone") == Some(0) {
        return false;
    }
    // Ubuntu AppArmor restriction on unprivileged user namespaces
    if read_sysctl("/proc/sys/kernel/apparmor_restrict_unprivileged_userns") == Some(1) {
        return false;
    }
    read_sysctl("/proc/sys/user/max_user_namespaces").is_none_or(|max| max > 0)
}

fn read_sysctl(path: &str) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(euid: u32) -> HostCapabilities {
        HostCapabilities {
            euid,
            mount_ns: true,
            pid_ns: true,
            net_ns: true,
            user_ns: true,
            ipc_ns: true,
            uts_ns: true,
            unprivileged_userns: true,
        }
    }

    #[test]
    fn full_host_supports_full_isolation() {
        assert_eq!(caps(1000).max_level(false), IsolationLevel::Full);
        assert_eq!(caps(0).max_level(false), IsolationLevel::Full);
    }

    #[test]
    fn unprivileged_without_userns_gets_nothing() {
        let mut c = caps(1000);
        c.unprivileged_userns = false;
        assert_eq!(c.max_level(false), IsolationLevel::None);

        c.euid = 0;
        assert_eq!(c.max_level(false), IsolationLevel::Full);
    }

    #[test]
    fn missing_namespaces_lower_the_ceiling() {
        let mut c = caps(1000);
        c.net_ns = false;
        assert_eq!(c.max_level(false), IsolationLevel::Process);
        assert_eq!(c.max_level(true), IsolationLevel::Full);

        c.pid_ns = false;
        assert_eq!(c.max_level(true), IsolationLevel::Filesystem);
    }

    #[test]
    fn probe_does_not_panic() {
        let c = HostCapabilities::probe();
        let _ = c.max_level(false);
    }
}
