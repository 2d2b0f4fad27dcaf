//! The container record.
//!
//! A container couples a name in the hierarchy with its configuration, its
//! runtime footprint (pids, times, exit status) and its position in the
//! tree. The registry owns every record; parents are weak back-references
//! and children are owned by their parent's list, so dropping a destroyed
//! record needs no cycle collection.
//!
//! Mutable state lives behind a plain mutex with short critical sections;
//! logical transactions (start, stop, property writes) are serialized by
//! the hierarchical locks in [`crate::registry`].

use std::collections::HashSet;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::AtomicI32;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::debug;

use crate::caps::{no_caps, CapSet};
use crate::cgroup::{
    Cgroup, Subsystem, CONTROLLER_ALL, CONTROLLER_CPUACCT, CONTROLLER_FREEZER,
};
use crate::config::DaemonConfig;
use crate::cred::{AccessLevel, Cred};
use crate::error::{Error, ErrorKind, Result};
use crate::name::{first_name, level, ROOT_CONTAINER};
use crate::net::NetConfig;
use crate::state::ContainerState;
use crate::waiter::Waiter;

/// Milliseconds since the unix epoch.
#[must_use]
pub fn wall_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Virtualization mode of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VirtMode {
    /// Runs one application command.
    #[default]
    App,
    /// Runs a whole userspace starting from init.
    Os,
}

impl VirtMode {
    /// Parses the property spelling.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for unknown modes.
    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "app" => Ok(Self::App),
            "os" => Ok(Self::Os),
            _ => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown virt mode '{text}'"),
            )),
        }
    }
}

impl std::fmt::Display for VirtMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::App => "app",
            Self::Os => "os",
        })
    }
}

/// A bind mount requested by the container spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Source path in the parent mount namespace.
    pub source: PathBuf,
    /// Target path inside the container root.
    pub target: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
}

impl BindMount {
    /// Parses one `source target [ro|rw]` entry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for malformed entries.
    pub fn parse(entry: &str) -> Result<Self> {
        let mut fields = entry.split_whitespace();
        let source = fields
            .next()
            .ok_or_else(|| Error::new(ErrorKind::InvalidValue, "bind: missing source"))?;
        let target = fields
            .next()
            .ok_or_else(|| Error::new(ErrorKind::InvalidValue, "bind: missing target"))?;
        let read_only = match fields.next() {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(other) => {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("bind: unknown flag '{other}'"),
                ))
            }
        };
        Ok(Self {
            source: PathBuf::from(source),
            target: PathBuf::from(target),
            read_only,
        })
    }

    /// Formats back into the property syntax.
    #[must_use]
    pub fn format(&self) -> String {
        format!(
            "{} {} {}",
            self.source.display(),
            self.target.display(),
            if self.read_only { "ro" } else { "rw" }
        )
    }
}

/// Property identifiers for the explicitly-set and needs-rewrite bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Prop {
    Command,
    Cwd,
    Env,
    Isolate,
    VirtMode,
    Root,
    RootRo,
    BindDns,
    Hostname,
    ResolvConf,
    Umask,
    User,
    Group,
    Stdin,
    Stdout,
    Stderr,
    StdoutLimit,
    Net,
    NetPriority,
    NetGuarantee,
    NetLimit,
    MemLimit,
    MemGuarantee,
    AnonLimit,
    DirtyLimit,
    RechargeOnPgfault,
    CpuPolicy,
    CpuLimit,
    CpuGuarantee,
    IoPolicy,
    IoLimit,
    IoOpsLimit,
    Respawn,
    MaxRespawns,
    RespawnCount,
    AgingTime,
    NsName,
    Capabilities,
    CapAmbient,
    Devices,
    Bind,
    Ulimit,
    Controllers,
    AccessLevel,
    Weak,
    Private,
    State,
    RootPid,
    ExitStatus,
    OomKilled,
    StartTime,
    DeathTime,
}

/// Static configuration of a container, mostly property-backed.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Command line; empty makes the container meta.
    pub command: String,
    /// Working directory inside the container root.
    pub cwd: PathBuf,
    /// Environment entries, `KEY=VALUE`.
    pub env: Vec<String>,
    /// Private pid/ipc (and usually mount/uts) namespaces.
    pub isolate: bool,
    /// Application or os virtualization.
    pub virt_mode: VirtMode,
    /// Root path relative to the parent's root.
    pub root: PathBuf,
    /// Remount the root read-only.
    pub root_ro: bool,
    /// Bind the host resolv.conf into a chrooted container.
    pub bind_dns: bool,
    /// UTS hostname; empty keeps the parent's.
    pub hostname: String,
    /// Literal resolv.conf lines.
    pub resolv_conf: Vec<String>,
    /// File mode creation mask.
    pub umask: u32,
    /// Owner identity; commands run as this user in app mode.
    pub owner: Cred,
    /// Stdin path, outside view.
    pub stdin_path: PathBuf,
    /// Stdout path; relative paths land in the container work dir.
    pub stdout_path: PathBuf,
    /// Stderr path; relative paths land in the container work dir.
    pub stderr_path: PathBuf,
    /// Rotation threshold for stdout/stderr files.
    pub stdout_limit: u64,
    /// Network mode and rate maps.
    pub net: NetConfig,
    /// Memory limit in bytes, 0 for none.
    pub mem_limit: u64,
    /// Memory guarantee in bytes.
    pub mem_guarantee: u64,
    /// Anonymous memory limit in bytes.
    pub anon_limit: u64,
    /// Dirty page limit in bytes.
    pub dirty_limit: u64,
    /// Account page faults to the faulting cgroup.
    pub recharge_on_pgfault: bool,
    /// Cpu scheduling policy: normal, rt or idle.
    pub cpu_policy: String,
    /// Cpu limit in cores.
    pub cpu_limit: f64,
    /// Cpu guarantee in cores.
    pub cpu_guarantee: f64,
    /// Io scheduling policy: normal or batch.
    pub io_policy: String,
    /// Io bandwidth limit, bytes per second.
    pub io_limit: u64,
    /// Io operations limit per second.
    pub io_ops_limit: u64,
    /// Restart the container when it dies.
    pub respawn: bool,
    /// Respawn budget; negative means unlimited.
    pub max_respawns: i64,
    /// How long a Dead container lingers before aging out.
    pub aging_time: Duration,
    /// Namespace component this container prepends for its subtree.
    pub ns_name: String,
    /// Upper capability limit (bounding + permitted).
    pub cap_limit: CapSet,
    /// Requested ambient capabilities.
    pub cap_ambient: CapSet,
    /// Allowed-at-start set computed by sanitization.
    pub cap_allowed: CapSet,
    /// Device access entries for the devices controller.
    pub devices: Vec<String>,
    /// Bind mounts applied inside the container.
    pub bind_mounts: Vec<BindMount>,
    /// Rlimits by resource name: (soft, hard).
    pub rlimits: std::collections::HashMap<String, (u64, u64)>,
    /// Requested cgroup controllers.
    pub controllers: u32,
    /// Controllers the engine insists on.
    pub required_controllers: u32,
    /// API access level granted to the container's inhabitants.
    pub access_level: AccessLevel,
    /// Free-form owner note.
    pub private: String,
}

/// Runtime footprint of a started container.
#[derive(Debug, Clone, Default)]
pub struct Runtime {
    /// Main task pid in the host namespace.
    pub task_pid: i32,
    /// Main task pid inside the container's pid namespace.
    pub task_vpid: i32,
    /// Pid the daemon waits on; differs from the task when a pid-1 helper
    /// fronts it.
    pub wait_pid: i32,
    /// Start time, wall-clock ms.
    pub start_time_ms: u64,
    /// Death time, wall-clock ms.
    pub death_time_ms: u64,
    /// Raw exit status from waitpid.
    pub exit_status: i32,
    /// The kernel OOM killer took the task down.
    pub oom_killed: bool,
    /// Completed respawns so far.
    pub respawn_count: u64,
}

/// Mutable half of the record.
#[derive(Debug)]
pub struct Inner {
    /// Lifecycle state.
    pub state: ContainerState,
    /// Configuration.
    pub spec: ContainerSpec,
    /// Runtime footprint.
    pub runtime: Runtime,
    /// Properties explicitly set by a client.
    pub set_props: HashSet<Prop>,
    /// Properties needing a rewrite into the kernel.
    pub dirty_props: HashSet<Prop>,
    /// Containers one level below, in creation order.
    pub children: Vec<Arc<Container>>,
    /// Running or Meta containers in the subtree below (and including)
    /// direct children.
    pub running_children: usize,
    /// Armed OOM eventfd while running with a memory controller.
    pub oom_fd: Option<OwnedFd>,
    /// Root volume directory bound for this run, if any.
    pub root_volume: Option<PathBuf>,
    /// Exact-name waiters for this container.
    pub waiters: Vec<Weak<Waiter>>,
    /// Destroy when the owning client disconnects.
    pub is_weak: bool,
}

/// A container record. Shared as `Arc<Container>`.
#[derive(Debug)]
pub struct Container {
    /// Dense id, stable across restarts.
    pub id: u32,
    /// Absolute hierarchical name.
    pub name: String,
    /// Last path component.
    pub first_name: String,
    /// Depth in the tree; the root is 0.
    pub level: usize,
    parent: Option<Weak<Container>>,
    /// Hierarchical lock word: +N readers, -1 writer. Guarded by the
    /// registry mutex, never touched elsewhere.
    pub(crate) locked: AtomicI32,
    inner: Mutex<Inner>,
}

impl ContainerSpec {
    fn new(parent: Option<&Arc<Container>>, config: &DaemonConfig) -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        let (access_level, controllers) = match parent {
            None => (AccessLevel::Normal, CONTROLLER_ALL),
            Some(parent) => {
                let parent_inner = parent.lock_inner();
                let level = if parent_inner.spec.access_level < AccessLevel::ChildOnly {
                    parent_inner.spec.access_level
                } else {
                    AccessLevel::Normal
                };
                let controllers = if parent.is_root() {
                    CONTROLLER_ALL
                } else {
                    CONTROLLER_FREEZER | CONTROLLER_CPUACCT
                };
                (level, controllers)
            }
        };

        Self {
            command: String::new(),
            cwd: PathBuf::from("/"),
            env: Vec::new(),
            isolate: true,
            virt_mode: VirtMode::App,
            root: PathBuf::from("/"),
            root_ro: false,
            bind_dns: true,
            hostname: String::new(),
            resolv_conf: Vec::new(),
            umask: 0o002,
            owner: Cred::default(),
            stdin_path: PathBuf::from("/dev/null"),
            stdout_path: PathBuf::from("stdout"),
            stderr_path: PathBuf::from("stderr"),
            stdout_limit: config.container.stdout_limit,
            net: NetConfig::default(),
            mem_limit: 0,
            mem_guarantee: 0,
            anon_limit: 0,
            dirty_limit: 0,
            recharge_on_pgfault: false,
            cpu_policy: "normal".to_string(),
            cpu_limit: cpus as f64,
            cpu_guarantee: 0.0,
            io_policy: "normal".to_string(),
            io_limit: 0,
            io_ops_limit: 0,
            respawn: false,
            max_respawns: -1,
            aging_time: config.container.default_aging_time,
            ns_name: String::new(),
            cap_limit: no_caps(),
            cap_ambient: no_caps(),
            cap_allowed: no_caps(),
            devices: Vec::new(),
            bind_mounts: Vec::new(),
            rlimits: std::collections::HashMap::new(),
            controllers,
            required_controllers: CONTROLLER_FREEZER,
            access_level,
            private: String::new(),
        }
    }
}

impl Container {
    /// Builds a fresh record in Stopped state. Registration with the
    /// registry and the parent's children list is the caller's job.
    #[must_use]
    pub fn new(
        parent: Option<&Arc<Container>>,
        name: &str,
        id: u32,
        config: &DaemonConfig,
    ) -> Arc<Self> {
        let spec = ContainerSpec::new(parent, config);
        Arc::new(Self {
            id,
            name: name.to_string(),
            first_name: if name == ROOT_CONTAINER {
                String::new()
            } else {
                first_name(name).to_string()
            },
            level: level(name),
            parent: parent.map(Arc::downgrade),
            locked: AtomicI32::new(0),
            inner: Mutex::new(Inner {
                state: ContainerState::Stopped,
                spec,
                runtime: Runtime::default(),
                set_props: HashSet::new(),
                dirty_props: HashSet::new(),
                children: Vec::new(),
                running_children: 0,
                oom_fd: None,
                root_volume: None,
                waiters: Vec::new(),
                is_weak: false,
            }),
        })
    }

    /// True for the root container.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.name == ROOT_CONTAINER
    }

    /// True when no command is configured.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.lock_inner().spec.command.is_empty()
    }

    /// The parent record, if this is not the root.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Container>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Ancestors from the parent up to the root.
    #[must_use]
    pub fn ancestors(&self) -> Vec<Arc<Container>> {
        let mut chain = Vec::new();
        let mut cursor = self.parent();
        while let Some(ct) = cursor {
            cursor = ct.parent();
            chain.push(ct);
        }
        chain
    }

    /// True if `ancestor` is a proper ancestor of this container.
    #[must_use]
    pub fn is_child_of(&self, ancestor: &Arc<Container>) -> bool {
        self.ancestors()
            .iter()
            .any(|ct| Arc::ptr_eq(ct, ancestor))
    }

    /// Locks the mutable half.
    ///
    /// # Panics
    ///
    /// Panics if a previous holder panicked.
    pub fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("container state poisoned")
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.lock_inner().state
    }

    /// Direct children, in creation order.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<Container>> {
        self.lock_inner().children.clone()
    }

    /// The whole subtree in post-order: descendants first, self last.
    #[must_use]
    pub fn subtree(self: &Arc<Self>) -> Vec<Arc<Container>> {
        let mut out = Vec::new();
        for child in self.children() {
            out.extend(child.subtree());
        }
        out.push(self.clone());
        out
    }

    /// The nearest ancestor (or self) with `isolate = true`.
    #[must_use]
    pub fn isolation_domain(self: &Arc<Self>) -> Arc<Container> {
        let mut domain = self.clone();
        loop {
            if domain.lock_inner().spec.isolate {
                return domain;
            }
            match domain.parent() {
                Some(parent) => domain = parent,
                None => return domain,
            }
        }
    }

    /// Nearest ancestor whose task is alive.
    #[must_use]
    pub fn running_parent(&self) -> Option<Arc<Container>> {
        self.ancestors()
            .into_iter()
            .find(|ct| ct.lock_inner().runtime.task_pid != 0)
    }

    /// True once a set bit exists for `prop`.
    #[must_use]
    pub fn has_prop(&self, prop: Prop) -> bool {
        self.lock_inner().set_props.contains(&prop)
    }

    /// Marks `prop` explicitly set and needing a kernel rewrite.
    pub fn set_prop(&self, prop: Prop) {
        let mut inner = self.lock_inner();
        inner.set_props.insert(prop);
        inner.dirty_props.insert(prop);
    }

    /// Clears the set bit for `prop`.
    pub fn clear_prop(&self, prop: Prop) {
        let mut inner = self.lock_inner();
        inner.set_props.remove(&prop);
        inner.dirty_props.remove(&prop);
    }

    /// Consumes the dirty bit for `prop`, returning whether it was set.
    pub fn test_clear_dirty(&self, prop: Prop) -> bool {
        self.lock_inner().dirty_props.remove(&prop)
    }

    /// The daemon-relative cgroup name in `subsystem`.
    ///
    /// Branch components where the subsystem's controller is disabled are
    /// folded into the parent component with a `%` separator, so a record
    /// always maps to exactly one group per subsystem.
    #[must_use]
    pub fn cgroup_name(self: &Arc<Self>, subsystem: Subsystem) -> String {
        if self.is_root() {
            return String::new();
        }
        let mut name = String::new();
        let mut cursor = Some(self.clone());
        while let Some(ct) = cursor {
            if ct.is_root() {
                break;
            }
            let enabled = ct.lock_inner().spec.controllers & subsystem.controller() != 0;
            if name.is_empty() {
                if enabled {
                    name = ct.first_name.clone();
                }
            } else {
                let sep = if enabled { '/' } else { '%' };
                name = format!("{}{}{}", ct.first_name, sep, name);
            }
            cursor = ct.parent();
        }
        name
    }

    /// The cgroup of this container in `subsystem`.
    #[must_use]
    pub fn cgroup(self: &Arc<Self>, subsystem: Subsystem, config: &DaemonConfig) -> Cgroup {
        subsystem.cgroup(&config.cgroup_root, &self.cgroup_name(subsystem))
    }

    /// Host-side scratch directory for this container.
    #[must_use]
    pub fn work_path(&self, config: &DaemonConfig) -> PathBuf {
        config.tmp_dir.join(self.name.trim_start_matches('/'))
    }

    /// Effective working directory: the nearest explicit `cwd` up the
    /// chain, cut off at a chroot boundary.
    #[must_use]
    pub fn effective_cwd(self: &Arc<Self>) -> PathBuf {
        let mut cursor = Some(self.clone());
        while let Some(ct) = cursor {
            if ct.has_prop(Prop::Cwd) {
                return ct.lock_inner().spec.cwd.clone();
            }
            if ct.lock_inner().spec.root != std::path::Path::new("/") {
                return PathBuf::from("/");
            }
            cursor = ct.parent();
        }
        self.lock_inner().spec.cwd.clone()
    }

    /// Applies a state change, maintaining the running-descendants
    /// counters on every ancestor and waking waiters on terminal states.
    pub fn change_state(self: &Arc<Self>, new_state: ContainerState, wildcard: &crate::waiter::WildcardWaiters) {
        let old_state = {
            let mut inner = self.lock_inner();
            let old = inner.state;
            if old == new_state {
                return;
            }
            inner.state = new_state;
            old
        };

        debug!(name = %self.name, from = %old_state, to = %new_state, "state change");

        if new_state == ContainerState::Running {
            self.update_running_children(1, wildcard);
        } else if old_state == ContainerState::Running {
            self.update_running_children(-1, wildcard);
        }

        if !new_state.is_alive() {
            self.notify_waiters(wildcard);
        }
    }

    /// Adjusts the running-descendants counter here and on every ancestor.
    ///
    /// A meta container whose counter reaches zero wakes its waiters: for
    /// a meta the interesting edge is "all work below finished".
    pub fn update_running_children(self: &Arc<Self>, diff: i64, wildcard: &crate::waiter::WildcardWaiters) {
        let mut cursor = Some(self.clone());
        while let Some(ct) = cursor {
            let notify = {
                let mut inner = ct.lock_inner();
                inner.running_children = inner
                    .running_children
                    .saturating_add_signed(diff as isize);
                inner.running_children == 0 && inner.state == ContainerState::Meta
            };
            if notify {
                ct.notify_waiters(wildcard);
            }
            cursor = ct.parent();
        }
    }

    /// Wakes this container's exact-name waiters and the wildcard list.
    pub fn notify_waiters(self: &Arc<Self>, wildcard: &crate::waiter::WildcardWaiters) {
        let waiters = {
            let mut inner = self.lock_inner();
            inner.waiters.retain(|w| w.upgrade().is_some());
            inner.waiters.clone()
        };
        for weak in waiters {
            if let Some(waiter) = weak.upgrade() {
                waiter.wake(Some(self));
            }
        }
        if !self.is_root() {
            wildcard.wake_all(self);
        }
    }

    /// Registers an exact-name waiter.
    pub fn add_waiter(&self, waiter: &Arc<Waiter>) {
        let mut inner = self.lock_inner();
        inner.waiters.retain(|w| w.upgrade().is_some());
        inner.waiters.push(Arc::downgrade(waiter));
    }

    /// Concatenated namespace prefix of this container's subtree view,
    /// without a trailing slash; empty for the root view.
    #[must_use]
    pub fn namespace(self: &Arc<Self>) -> String {
        let mut components = Vec::new();
        let mut cursor = Some(self.clone());
        while let Some(ct) = cursor {
            let ns = ct.lock_inner().spec.ns_name.clone();
            if !ns.is_empty() {
                components.push(ns);
            }
            cursor = ct.parent();
        }
        components.reverse();
        components.join("/")
    }

    /// True for a Dead container past its aging deadline.
    #[must_use]
    pub fn expired(&self) -> bool {
        let inner = self.lock_inner();
        inner.state == ContainerState::Dead
            && wall_ms() >= inner.runtime.death_time_ms + inner.spec.aging_time.as_millis() as u64
    }

    /// True when a death should be followed by a scheduled respawn.
    #[must_use]
    pub fn may_respawn(&self) -> bool {
        let parent_alive = self
            .parent()
            .is_some_and(|parent| parent.state().is_alive());
        let inner = self.lock_inner();
        inner.state == ContainerState::Dead
            && inner.spec.respawn
            && parent_alive
            && (inner.spec.max_respawns < 0
                || inner.runtime.respawn_count < inner.spec.max_respawns as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::WildcardWaiters;

    fn config() -> DaemonConfig {
        DaemonConfig::default()
    }

    fn tree() -> (Arc<Container>, Arc<Container>, Arc<Container>) {
        let config = config();
        let root = Container::new(None, "/", 0, &config);
        let a = Container::new(Some(&root), "a", 1, &config);
        root.lock_inner().children.push(a.clone());
        let b = Container::new(Some(&a), "a/b", 2, &config);
        a.lock_inner().children.push(b.clone());
        (root, a, b)
    }

    #[test]
    fn topology_helpers() {
        let (root, a, b) = tree();
        assert!(root.is_root());
        assert_eq!(b.level, 2);
        assert_eq!(b.first_name, "b");
        assert!(b.is_child_of(&a));
        assert!(b.is_child_of(&root));
        assert!(!a.is_child_of(&b));
        assert_eq!(b.ancestors().len(), 2);

        let subtree = root.subtree();
        let names: Vec<_> = subtree.iter().map(|ct| ct.name.as_str()).collect();
        assert_eq!(names, ["a/b", "a", "/"]);
    }

    #[test]
    fn running_children_counters() {
        let (root, a, b) = tree();
        let wildcard = WildcardWaiters::default();
        b.change_state(ContainerState::Running, &wildcard);
        assert_eq!(b.lock_inner().running_children, 1);
        assert_eq!(a.lock_inner().running_children, 1);
        assert_eq!(root.lock_inner().running_children, 1);

        b.change_state(ContainerState::Dead, &wildcard);
        assert_eq!(a.lock_inner().running_children, 0);
        assert_eq!(root.lock_inner().running_children, 0);
    }

    #[test]
    fn cgroup_name_folds_disabled_levels() {
        let (_root, a, b) = tree();
        let config = config();
        a.lock_inner().spec.controllers = CONTROLLER_ALL;
        b.lock_inner().spec.controllers = CONTROLLER_FREEZER;
        let c = Container::new(Some(&b), "a/b/c", 3, &config);
        b.lock_inner().children.push(c.clone());
        c.lock_inner().spec.controllers = CONTROLLER_ALL;

        assert_eq!(b.cgroup_name(Subsystem::Freezer), "a/b");
        // A container without its own memory group lands in the nearest
        // enabled ancestor's.
        assert_eq!(b.cgroup_name(Subsystem::Memory), "a");
        // A disabled middle level folds into its parent component.
        assert_eq!(c.cgroup_name(Subsystem::Memory), "a/b%c");
        assert_eq!(c.cgroup_name(Subsystem::Freezer), "a/b/c");
    }

    #[test]
    fn namespace_concatenates() {
        let (_root, a, b) = tree();
        a.lock_inner().spec.ns_name = "a".to_string();
        assert_eq!(b.namespace(), "a");
        b.lock_inner().spec.ns_name = "b".to_string();
        assert_eq!(b.namespace(), "a/b");
    }

    #[test]
    fn isolation_domain_walks_up() {
        let (_root, a, b) = tree();
        b.lock_inner().spec.isolate = false;
        assert!(Arc::ptr_eq(&b.isolation_domain(), &a));
        a.lock_inner().spec.isolate = false;
        assert!(b.isolation_domain().is_root());
    }

    #[test]
    fn respawn_gate() {
        let (_root, a, b) = tree();
        let wildcard = WildcardWaiters::default();
        assert!(!b.may_respawn());
        {
            let mut inner = b.lock_inner();
            inner.spec.respawn = true;
            inner.spec.max_respawns = 2;
        }
        a.change_state(ContainerState::Meta, &wildcard);
        b.change_state(ContainerState::Dead, &wildcard);
        assert!(b.may_respawn());
        b.lock_inner().runtime.respawn_count = 2;
        assert!(!b.may_respawn());
        b.lock_inner().spec.max_respawns = -1;
        assert!(b.may_respawn());
    }

    #[test]
    fn bind_mount_parse() {
        let bind = BindMount::parse("/src /dst ro").unwrap();
        assert!(bind.read_only);
        assert_eq!(bind.format(), "/src /dst ro");
        assert!(!BindMount::parse("/src /dst").unwrap().read_only);
        assert!(BindMount::parse("/src").is_err());
        assert!(BindMount::parse("/src /dst maybe").is_err());
    }
}
