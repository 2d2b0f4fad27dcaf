//! Cgroup-v1 driver.
//!
//! The engine joins every container to a matching cgroup in each enabled
//! subsystem. This module owns the filesystem side: creating and removing
//! groups, attaching tasks, reading and writing knobs, freezer control and
//! OOM event plumbing. Policy (which controllers a container gets, limit
//! values) stays with the container record.

use std::fs;
use std::io::Write;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, ErrorKind, Result};

/// Controller bit for the freezer subsystem, always required.
pub const CONTROLLER_FREEZER: u32 = 1 << 0;
/// Controller bit for the memory subsystem.
pub const CONTROLLER_MEMORY: u32 = 1 << 1;
/// Controller bit for the cpu subsystem.
pub const CONTROLLER_CPU: u32 = 1 << 2;
/// Controller bit for the cpuacct subsystem.
pub const CONTROLLER_CPUACCT: u32 = 1 << 3;
/// Controller bit for the blkio subsystem.
pub const CONTROLLER_BLKIO: u32 = 1 << 4;
/// Controller bit for the net_cls subsystem.
pub const CONTROLLER_NETCLS: u32 = 1 << 5;
/// Controller bit for the devices subsystem.
pub const CONTROLLER_DEVICES: u32 = 1 << 6;

/// Every controller this build manages.
pub const CONTROLLER_ALL: u32 = CONTROLLER_FREEZER
    | CONTROLLER_MEMORY
    | CONTROLLER_CPU
    | CONTROLLER_CPUACCT
    | CONTROLLER_BLKIO
    | CONTROLLER_NETCLS
    | CONTROLLER_DEVICES;

/// Name of the daemon's own branch under each subsystem root.
pub const CGROUP_PREFIX: &str = "warren";

/// One cgroup-v1 subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    /// `freezer`
    Freezer,
    /// `memory`
    Memory,
    /// `cpu`
    Cpu,
    /// `cpuacct`
    Cpuacct,
    /// `blkio`
    Blkio,
    /// `net_cls`
    NetCls,
    /// `devices`
    Devices,
}

/// All subsystems in a fixed iteration order, freezer first.
pub const SUBSYSTEMS: &[Subsystem] = &[
    Subsystem::Freezer,
    Subsystem::Memory,
    Subsystem::Cpu,
    Subsystem::Cpuacct,
    Subsystem::Blkio,
    Subsystem::NetCls,
    Subsystem::Devices,
];

impl Subsystem {
    /// Mount directory name under the cgroup root.
    #[must_use]
    pub const fn dir(self) -> &'static str {
        match self {
            Self::Freezer => "freezer",
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Cpuacct => "cpuacct",
            Self::Blkio => "blkio",
            Self::NetCls => "net_cls",
            Self::Devices => "devices",
        }
    }

    /// Controller bit for this subsystem.
    #[must_use]
    pub const fn controller(self) -> u32 {
        match self {
            Self::Freezer => CONTROLLER_FREEZER,
            Self::Memory => CONTROLLER_MEMORY,
            Self::Cpu => CONTROLLER_CPU,
            Self::Cpuacct => CONTROLLER_CPUACCT,
            Self::Blkio => CONTROLLER_BLKIO,
            Self::NetCls => CONTROLLER_NETCLS,
            Self::Devices => CONTROLLER_DEVICES,
        }
    }

    /// Cgroup for `name` (daemon-relative, `""` for the daemon branch
    /// itself) under this subsystem.
    #[must_use]
    pub fn cgroup(self, root: &Path, name: &str) -> Cgroup {
        let mut path = root.join(self.dir()).join(CGROUP_PREFIX);
        if !name.is_empty() {
            path = path.join(name);
        }
        Cgroup {
            subsystem: self,
            path,
        }
    }

    /// The subsystem root cgroup, outside the daemon branch.
    #[must_use]
    pub fn root_cgroup(self, root: &Path) -> Cgroup {
        Cgroup {
            subsystem: self,
            path: root.join(self.dir()),
        }
    }

    /// Finds the cgroup of `pid` in this subsystem via `/proc/<pid>/cgroup`.
    ///
    /// The returned path component is relative to the subsystem root, with
    /// no leading slash.
    ///
    /// # Errors
    ///
    /// Returns `Unknown` when the proc file is unreadable or the subsystem
    /// line is missing.
    pub fn task_cgroup(self, pid: i32) -> Result<String> {
        let text = fs::read_to_string(format!("/proc/{pid}/cgroup"))?;
        for line in text.lines() {
            let mut fields = line.splitn(3, ':');
            let _id = fields.next();
            let controllers = fields.next().unwrap_or("");
            let path = fields.next().unwrap_or("");
            if controllers.split(',').any(|c| c == self.dir()) {
                return Ok(path.trim_start_matches('/').to_string());
            }
        }
        Err(Error::new(
            ErrorKind::Unknown,
            format!("no {} cgroup for pid {pid}", self.dir()),
        ))
    }
}

/// A concrete cgroup directory in one subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    /// Owning subsystem.
    pub subsystem: Subsystem,
    /// Absolute directory path.
    pub path: PathBuf,
}

impl Cgroup {
    /// True if the directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Creates the directory, parents included.
    ///
    /// # Errors
    ///
    /// Propagates the filesystem error with the errno preserved.
    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.path)
            .map_err(|e| Error::from(e).context(format!("mkdir {}", self.path.display())))
    }

    /// Removes the directory. Tasks must be gone first.
    ///
    /// # Errors
    ///
    /// Propagates the filesystem error with the errno preserved.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e).context(format!("rmdir {}", self.path.display()))),
        }
    }

    /// Path of a knob file inside the group.
    #[must_use]
    pub fn knob_path(&self, knob: &str) -> PathBuf {
        self.path.join(knob)
    }

    /// True if the knob file exists.
    #[must_use]
    pub fn has(&self, knob: &str) -> bool {
        self.knob_path(knob).is_file()
    }

    /// Writes a knob value.
    ///
    /// # Errors
    ///
    /// Propagates the filesystem error with the errno preserved.
    pub fn set(&self, knob: &str, value: &str) -> Result<()> {
        fs::write(self.knob_path(knob), value)
            .map_err(|e| Error::from(e).context(format!("write {knob}")))
    }

    /// Reads a knob value, trimmed.
    ///
    /// # Errors
    ///
    /// Propagates the filesystem error with the errno preserved.
    pub fn get(&self, knob: &str) -> Result<String> {
        let text = fs::read_to_string(self.knob_path(knob))
            .map_err(|e| Error::from(e).context(format!("read {knob}")))?;
        Ok(text.trim().to_string())
    }

    /// Reads a numeric knob.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), plus `Unknown` when the value is not a number.
    pub fn get_u64(&self, knob: &str) -> Result<u64> {
        let text = self.get(knob)?;
        text.parse()
            .map_err(|_| Error::new(ErrorKind::Unknown, format!("{knob}: bad value '{text}'")))
    }

    /// Moves a task into the group.
    ///
    /// # Errors
    ///
    /// Propagates the filesystem error with the errno preserved.
    pub fn attach(&self, pid: i32) -> Result<()> {
        self.set("cgroup.procs", &pid.to_string())
            .map_err(|e| e.context(format!("attach {pid} to {}", self.path.display())))
    }

    /// Lists the tasks in the group.
    ///
    /// # Errors
    ///
    /// Propagates the filesystem error with the errno preserved.
    pub fn tasks(&self) -> Result<Vec<i32>> {
        let text = fs::read_to_string(self.knob_path("cgroup.procs"))?;
        Ok(text.lines().filter_map(|l| l.trim().parse().ok()).collect())
    }

    /// True when no tasks remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks().map_or(true, |tasks| tasks.is_empty())
    }

    /// Sends a signal to every task in the group.
    ///
    /// Disappearing tasks are skipped; other kill failures are logged and
    /// the sweep continues.
    ///
    /// # Errors
    ///
    /// Fails only when the task list cannot be read.
    pub fn kill_all(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        for pid in self.tasks()? {
            match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(errno) => {
                    warn!(pid, %errno, cgroup = %self.path.display(), "kill failed");
                }
            }
        }
        Ok(())
    }
}

// Freezer knobs.

/// Freezes a freezer cgroup and waits for the state to settle.
///
/// # Errors
///
/// Propagates knob write/read failures.
pub fn freeze(cg: &Cgroup) -> Result<()> {
    cg.set("freezer.state", "FROZEN")?;
    for _ in 0..1000 {
        if cg.get("freezer.state")? == "FROZEN" {
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    Err(Error::new(ErrorKind::Busy, "freezer did not settle"))
}

/// Thaws a freezer cgroup. With `wait`, blocks until thawed.
///
/// # Errors
///
/// Propagates knob write/read failures.
pub fn thaw(cg: &Cgroup, wait: bool) -> Result<()> {
    cg.set("freezer.state", "THAWED")?;
    if wait {
        for _ in 0..1000 {
            if cg.get("freezer.state")? == "THAWED" {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        return Err(Error::new(ErrorKind::Busy, "freezer did not thaw"));
    }
    Ok(())
}

/// True when the group is frozen, by itself or through an ancestor.
#[must_use]
pub fn is_frozen(cg: &Cgroup) -> bool {
    cg.get("freezer.state").map_or(false, |s| s != "THAWED")
}

/// True when the group itself asked to freeze.
#[must_use]
pub fn is_self_freezing(cg: &Cgroup) -> bool {
    cg.get("freezer.self_freezing").map_or(false, |s| s == "1")
}

/// True when an ancestor holds the group frozen.
#[must_use]
pub fn is_parent_freezing(cg: &Cgroup) -> bool {
    cg.get("freezer.parent_freezing").map_or(false, |s| s == "1")
}

// Memory knobs.

/// Writes the hard memory limit; 0 lifts the limit.
///
/// # Errors
///
/// `EBUSY` becomes `InvalidValue` (limit below current usage); other
/// failures keep their errno.
pub fn set_memory_limit(cg: &Cgroup, limit: u64) -> Result<()> {
    let value = if limit == 0 {
        "-1".to_string()
    } else {
        limit.to_string()
    };
    cg.set("memory.limit_in_bytes", &value).map_err(|e| {
        if e.raw_errno() == Some(libc::EBUSY) {
            Error::new(ErrorKind::InvalidValue, format!("memory limit {limit} is too low"))
        } else {
            e
        }
    })
}

/// Writes the soft memory limit.
///
/// # Errors
///
/// Propagates the knob write failure.
pub fn set_memory_soft_limit(cg: &Cgroup, limit: u64) -> Result<()> {
    cg.set("memory.soft_limit_in_bytes", &limit.to_string())
}

/// Reads the soft memory limit.
///
/// # Errors
///
/// Propagates the knob read failure.
pub fn memory_soft_limit(cg: &Cgroup) -> Result<u64> {
    cg.get_u64("memory.soft_limit_in_bytes")
}

/// Reads `memory.failcnt`.
///
/// # Errors
///
/// Propagates the knob read failure.
pub fn memory_failcnt(cg: &Cgroup) -> Result<u64> {
    cg.get_u64("memory.failcnt")
}

/// Creates an eventfd armed on the group's OOM notifications.
///
/// Writes `<eventfd> <oom_control fd>` into `cgroup.event_control`; the
/// control fd may be closed afterwards, the registration stays.
///
/// # Errors
///
/// Propagates eventfd creation and knob write failures.
pub fn setup_oom_event(cg: &Cgroup) -> Result<OwnedFd> {
    let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if raw < 0 {
        return Err(Error::errno(
            ErrorKind::Unknown,
            nix::errno::Errno::last(),
            "eventfd()",
        ));
    }
    let event_fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let control = fs::File::open(cg.knob_path("memory.oom_control"))
        .map_err(|e| Error::from(e).context("open memory.oom_control"))?;
    let mut register = fs::OpenOptions::new()
        .write(true)
        .open(cg.knob_path("cgroup.event_control"))
        .map_err(|e| Error::from(e).context("open cgroup.event_control"))?;
    let line = format!(
        "{} {}",
        raw_fd(&event_fd),
        std::os::fd::AsRawFd::as_raw_fd(&control)
    );
    register
        .write_all(line.as_bytes())
        .map_err(|e| Error::from(e).context("arm oom event"))?;
    Ok(event_fd)
}

/// Non-blocking read of an armed eventfd; true when it has fired.
#[must_use]
pub fn event_fired(fd: RawFd) -> bool {
    let mut value = 0u64;
    let rc = unsafe {
        libc::read(
            fd,
            std::ptr::addr_of_mut!(value).cast(),
            std::mem::size_of::<u64>(),
        )
    };
    rc == std::mem::size_of::<u64>() as isize && value != 0
}

fn raw_fd(fd: &OwnedFd) -> RawFd {
    std::os::fd::AsRawFd::as_raw_fd(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsystem_paths() {
        let root = Path::new("/sys/fs/cgroup");
        let cg = Subsystem::Memory.cgroup(root, "a/b");
        assert_eq!(cg.path, Path::new("/sys/fs/cgroup/memory/warren/a/b"));
        let branch = Subsystem::Freezer.cgroup(root, "");
        assert_eq!(branch.path, Path::new("/sys/fs/cgroup/freezer/warren"));
    }

    #[test]
    fn controller_bits_are_distinct() {
        let mut seen = 0u32;
        for subsystem in SUBSYSTEMS {
            let bit = subsystem.controller();
            assert_eq!(seen & bit, 0);
            seen |= bit;
        }
        assert_eq!(seen, CONTROLLER_ALL);
    }

    #[test]
    fn missing_group_reads_as_empty() {
        let cg = Cgroup {
            subsystem: Subsystem::Freezer,
            path: PathBuf::from("/nonexistent/warren/x"),
        };
        assert!(!cg.exists());
        assert!(cg.is_empty());
        assert!(cg.tasks().is_err());
    }

    #[test]
    fn remove_missing_is_ok() {
        let cg = Cgroup {
            subsystem: Subsystem::Freezer,
            path: PathBuf::from("/nonexistent/warren/x"),
        };
        assert!(cg.remove().is_ok());
    }
}
