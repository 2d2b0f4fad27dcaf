//! Linux capability sets and their application to the spawned task.
//!
//! A container carries three sets: the upper limit (bounding + permitted),
//! the allowed-at-start set derived from its virtualization mode, and the
//! ambient set requested by the owner. Sanitization keeps them consistent
//! with every ancestor's limit; application happens in the task process
//! just before exec, after credentials are dropped.

use crate::error::{Error, ErrorKind, Result};

/// Capability names in kernel bit order.
const CAP_NAMES: &[&str] = &[
    "CHOWN",
    "DAC_OVERRIDE",
    "DAC_READ_SEARCH",
    "FOWNER",
    "FSETID",
    "KILL",
    "SETGID",
    "SETUID",
    "SETPCAP",
    "LINUX_IMMUTABLE",
    "NET_BIND_SERVICE",
    "NET_BROADCAST",
    "NET_ADMIN",
    "NET_RAW",
    "IPC_LOCK",
    "IPC_OWNER",
    "SYS_MODULE",
    "SYS_RAWIO",
    "SYS_CHROOT",
    "SYS_PTRACE",
    "SYS_PACCT",
    "SYS_ADMIN",
    "SYS_BOOT",
    "SYS_NICE",
    "SYS_RESOURCE",
    "SYS_TIME",
    "SYS_TTY_CONFIG",
    "MKNOD",
    "LEASE",
    "AUDIT_WRITE",
    "AUDIT_CONTROL",
    "SETFCAP",
    "MAC_OVERRIDE",
    "MAC_ADMIN",
    "SYSLOG",
    "WAKE_ALARM",
    "BLOCK_SUSPEND",
    "AUDIT_READ",
];

const fn bit(name_index: usize) -> u64 {
    1 << name_index
}

const CAP_CHOWN: u64 = bit(0);
const CAP_DAC_OVERRIDE: u64 = bit(1);
const CAP_FOWNER: u64 = bit(3);
const CAP_FSETID: u64 = bit(4);
const CAP_KILL: u64 = bit(5);
const CAP_SETGID: u64 = bit(6);
const CAP_SETUID: u64 = bit(7);
const CAP_SETPCAP: u64 = bit(8);
const CAP_NET_BIND_SERVICE: u64 = bit(10);
const CAP_NET_ADMIN: u64 = bit(12);
const CAP_NET_RAW: u64 = bit(13);
const CAP_IPC_LOCK: u64 = bit(14);
const CAP_SYS_CHROOT: u64 = bit(18);
const CAP_SYS_PTRACE: u64 = bit(19);
const CAP_SYS_ADMIN: u64 = bit(21);
const CAP_SYS_BOOT: u64 = bit(22);
const CAP_SYS_NICE: u64 = bit(23);
const CAP_SYS_RESOURCE: u64 = bit(24);
const CAP_MKNOD: u64 = bit(27);
const CAP_AUDIT_WRITE: u64 = bit(29);
const CAP_SETFCAP: u64 = bit(31);

/// A set of Linux capabilities, one bit per capability number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapSet {
    /// Permitted mask, bit N for capability N.
    pub permitted: u64,
}

/// Everything this build knows about.
#[must_use]
pub fn all_caps() -> CapSet {
    CapSet {
        permitted: (1u64 << CAP_NAMES.len()) - 1,
    }
}

/// No capabilities at all.
#[must_use]
pub const fn no_caps() -> CapSet {
    CapSet { permitted: 0 }
}

/// Default allowed set for app-mode containers.
#[must_use]
pub const fn app_mode_caps() -> CapSet {
    CapSet {
        permitted: CAP_CHOWN
            | CAP_DAC_OVERRIDE
            | CAP_FOWNER
            | CAP_FSETID
            | CAP_KILL
            | CAP_SETGID
            | CAP_SETUID
            | CAP_SETPCAP
            | CAP_NET_BIND_SERVICE
            | CAP_NET_RAW
            | CAP_IPC_LOCK
            | CAP_SYS_CHROOT
            | CAP_SYS_PTRACE
            | CAP_MKNOD
            | CAP_AUDIT_WRITE
            | CAP_SETFCAP,
    }
}

/// Default allowed set for os-mode containers: app mode plus system knobs
/// an init process wants.
#[must_use]
pub const fn os_mode_caps() -> CapSet {
    CapSet {
        permitted: app_mode_caps().permitted
            | CAP_NET_ADMIN
            | CAP_SYS_BOOT
            | CAP_SYS_NICE
            | CAP_SYS_RESOURCE,
    }
}

/// Upper limit for non-root-owned app containers that explicitly list
/// capabilities; wider than the default allowed set.
#[must_use]
pub const fn suid_caps() -> CapSet {
    CapSet {
        permitted: app_mode_caps().permitted
            | CAP_NET_ADMIN
            | CAP_SYS_NICE
            | CAP_SYS_RESOURCE,
    }
}

/// Capabilities that are only safe inside a private pid namespace.
#[must_use]
pub const fn pid_ns_caps() -> CapSet {
    CapSet {
        permitted: CAP_KILL | CAP_SYS_PTRACE | CAP_SYS_BOOT,
    }
}

/// Capabilities that require a memory limit somewhere on the chain.
#[must_use]
pub const fn mem_cg_caps() -> CapSet {
    CapSet {
        permitted: CAP_IPC_LOCK | CAP_SYS_RESOURCE,
    }
}

/// Capabilities that are only safe inside a private network namespace.
#[must_use]
pub const fn net_ns_caps() -> CapSet {
    CapSet {
        permitted: CAP_NET_ADMIN | CAP_NET_RAW,
    }
}

/// Capabilities retained by the pid-1 helper so it can reap and forward
/// signals but nothing else.
#[must_use]
pub const fn init_helper_caps() -> CapSet {
    CapSet {
        permitted: CAP_KILL | CAP_SYS_ADMIN,
    }
}

impl CapSet {
    /// True when no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.permitted == 0
    }

    /// Set intersection.
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self {
            permitted: self.permitted & other.permitted,
        }
    }

    /// True if every bit of `self` is also in `other`.
    #[must_use]
    pub const fn subset_of(self, other: Self) -> bool {
        self.permitted & !other.permitted == 0
    }

    /// Formats as a `;` separated list of capability names.
    #[must_use]
    pub fn format(self) -> String {
        let mut names = Vec::new();
        for (idx, name) in CAP_NAMES.iter().enumerate() {
            if self.permitted & bit(idx) != 0 {
                names.push(*name);
            }
        }
        names.join(";")
    }

    /// Parses a `;` separated list of capability names, case-insensitive,
    /// with an optional `CAP_` prefix per entry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for unknown capability names.
    pub fn parse(text: &str) -> Result<Self> {
        let mut permitted = 0u64;
        for raw in text.split(';') {
            let token = raw.trim();
            if token.is_empty() {
                continue;
            }
            let upper = token.to_uppercase();
            let name = upper.strip_prefix("CAP_").unwrap_or(&upper);
            let idx = CAP_NAMES
                .iter()
                .position(|n| *n == name)
                .ok_or_else(|| {
                    Error::new(ErrorKind::InvalidValue, format!("unknown capability '{token}'"))
                })?;
            permitted |= bit(idx);
        }
        Ok(Self { permitted })
    }

    /// Drops every capability outside the set from the bounding set, then
    /// installs the set as permitted, effective and inheritable.
    ///
    /// Runs in the task process after fork. After a keepcaps credential
    /// drop the effective set is empty while permitted survives, so the
    /// permitted set is re-raised into effective first: the bounding
    /// drops need `SETPCAP` effective.
    ///
    /// # Errors
    ///
    /// Returns the failing prctl or capset errno.
    pub fn apply_limit(self) -> Result<()> {
        let (permitted, _, inheritable) = capget()?;
        capset(permitted, permitted, inheritable)?;
        for idx in 0..CAP_NAMES.len() {
            if self.permitted & bit(idx) == 0 {
                // Bounding drop of an already-absent cap fails with EINVAL
                // past the last cap the kernel knows; both are fine.
                let rc = unsafe {
                    libc::prctl(libc::PR_CAPBSET_DROP, idx as libc::c_ulong, 0, 0, 0)
                };
                if rc != 0 {
                    let errno = nix::errno::Errno::last();
                    if errno != nix::errno::Errno::EINVAL {
                        return Err(Error::errno(
                            ErrorKind::Unknown,
                            errno,
                            format!("prctl(PR_CAPBSET_DROP, {idx})"),
                        ));
                    }
                }
            }
        }
        capset(self.permitted, self.permitted, self.permitted)
    }

    /// Raises the set in the ambient set.
    ///
    /// Runs before [`apply_limit`](Self::apply_limit): the bits are first
    /// installed into the inheritable set (with effective re-raised from
    /// permitted, since a keepcaps credential drop cleared it), which the
    /// ambient prctl requires. The later limit application keeps the
    /// ambient bits alive as long as they stay within the limit.
    ///
    /// # Errors
    ///
    /// Returns the failing prctl or capset errno.
    pub fn apply_ambient(self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let (permitted, _, inheritable) = capget()?;
        capset(permitted, permitted, inheritable | self.permitted)?;
        for idx in 0..CAP_NAMES.len() {
            if self.permitted & bit(idx) != 0 {
                let rc = unsafe {
                    libc::prctl(
                        libc::PR_CAP_AMBIENT,
                        libc::PR_CAP_AMBIENT_RAISE as libc::c_ulong,
                        idx as libc::c_ulong,
                        0,
                        0,
                    )
                };
                if rc != 0 {
                    return Err(Error::errno(
                        ErrorKind::Unknown,
                        nix::errno::Errno::last(),
                        format!("prctl(PR_CAP_AMBIENT_RAISE, {})", CAP_NAMES[idx]),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Installs the set as the effective set, leaving permitted alone.
    ///
    /// # Errors
    ///
    /// Returns the capset errno.
    pub fn apply_effective(self) -> Result<()> {
        let current = capget()?;
        capset(current.0, self.permitted, current.2)
    }
}

#[repr(C)]
struct CapHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

const CAP_VERSION_3: u32 = 0x2008_0522;

fn capset(permitted: u64, effective: u64, inheritable: u64) -> Result<()> {
    let header = CapHeader {
        version: CAP_VERSION_3,
        pid: 0,
    };
    let data = [
        CapData {
            effective: effective as u32,
            permitted: permitted as u32,
            inheritable: inheritable as u32,
        },
        CapData {
            effective: (effective >> 32) as u32,
            permitted: (permitted >> 32) as u32,
            inheritable: (inheritable >> 32) as u32,
        },
    ];
    let rc = unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) };
    if rc != 0 {
        return Err(Error::errno(
            ErrorKind::Unknown,
            nix::errno::Errno::last(),
            "capset()",
        ));
    }
    Ok(())
}

fn capget() -> Result<(u64, u64, u64)> {
    let header = CapHeader {
        version: CAP_VERSION_3,
        pid: 0,
    };
    let mut data = [CapData::default(); 2];
    let rc = unsafe { libc::syscall(libc::SYS_capget, &header, data.as_mut_ptr()) };
    if rc != 0 {
        return Err(Error::errno(
            ErrorKind::Unknown,
            nix::errno::Errno::last(),
            "capget()",
        ));
    }
    let join = |lo: u32, hi: u32| u64::from(lo) | (u64::from(hi) << 32);
    Ok((
        join(data[0].permitted, data[1].permitted),
        join(data[0].effective, data[1].effective),
        join(data[0].inheritable, data[1].inheritable),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_round_trip() {
        let set = CapSet::parse("CHOWN;NET_ADMIN;SYS_PTRACE").unwrap();
        assert_eq!(set.format(), "CHOWN;NET_ADMIN;SYS_PTRACE");
        assert_eq!(CapSet::parse(&set.format()).unwrap(), set);
    }

    #[test]
    fn parse_accepts_prefix_and_case() {
        let a = CapSet::parse("cap_net_raw; kill").unwrap();
        let b = CapSet::parse("NET_RAW;KILL").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!(CapSet::parse("FLY").is_err());
    }

    #[test]
    fn empty_parse() {
        assert!(CapSet::parse("").unwrap().is_empty());
        assert_eq!(no_caps().format(), "");
    }

    #[test]
    fn mode_set_containment() {
        assert!(app_mode_caps().subset_of(os_mode_caps()));
        assert!(app_mode_caps().subset_of(suid_caps()));
        assert!(os_mode_caps().subset_of(all_caps()));
        assert!(pid_ns_caps().subset_of(all_caps()));
        assert!(mem_cg_caps().subset_of(all_caps()));
    }

    #[test]
    fn intersect_and_subset() {
        let a = CapSet::parse("CHOWN;KILL").unwrap();
        let b = CapSet::parse("KILL;NET_RAW").unwrap();
        let both = a.intersect(b);
        assert_eq!(both.format(), "KILL");
        assert!(both.subset_of(a));
        assert!(both.subset_of(b));
        assert!(!a.subset_of(b));
    }
}
