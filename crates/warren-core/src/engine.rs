//! The engine: one value owning every process-wide registry.
//!
//! The daemon entrypoint builds a single [`Engine`] and hands clones of
//! the `Arc` to the RPC server, the event workers and the reaper; tests
//! build throwaway engines against temporary directories. Nothing in the
//! crate reaches for a global.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::container::{Container, Prop};
use crate::cred::Cred;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{Event, EventQueue};
use crate::persist::{KvStore, KEY_ID, KEY_NAME};
use crate::props;
use crate::registry::Registry;
use crate::state::ContainerState;
use crate::volume::VolumeRegistry;
use crate::waiter::WildcardWaiters;

/// The container engine. Shared as `Arc<Engine>`.
pub struct Engine {
    /// Daemon configuration, immutable after startup.
    pub config: DaemonConfig,
    /// The container registry and lock manager.
    pub registry: Arc<Registry>,
    /// Delayed-event queue.
    pub events: Arc<EventQueue>,
    /// Persisted container snapshots.
    pub kv: KvStore,
    /// Volume table.
    pub volumes: VolumeRegistry,
    /// Process-global wildcard waiters.
    pub wildcard_waiters: WildcardWaiters,
    init_path: PathBuf,
    host_name: String,
}

impl Engine {
    /// Builds an engine, creating its state directories.
    ///
    /// # Errors
    ///
    /// Propagates directory creation failures.
    pub fn new(config: DaemonConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.tmp_dir)
            .map_err(|e| Error::from(e).context("create tmp dir"))?;
        let kv = KvStore::open(config.keyvalue_dir.clone())?;
        let volumes = VolumeRegistry::open(config.volumes_dir.clone())?;
        let registry = Arc::new(Registry::new(&config));

        let init_path = std::env::current_exe()
            .map(|exe| exe.with_file_name("warren-init"))
            .unwrap_or_else(|_| PathBuf::from("/usr/sbin/warren-init"));
        let host_name = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Arc::new(Self {
            config,
            registry,
            events: Arc::new(EventQueue::new()),
            kv,
            volumes,
            wildcard_waiters: WildcardWaiters::default(),
            init_path,
            host_name,
        }))
    }

    /// Path of the `warren-init` helper next to the daemon binary.
    #[must_use]
    pub fn init_path(&self) -> &Path {
        &self.init_path
    }

    /// Host name reported into container environments.
    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Marks the daemon a child subreaper so orphaned spawn brokers'
    /// children land back here for reaping.
    ///
    /// # Errors
    ///
    /// Propagates the prctl failure.
    pub fn become_subreaper() -> Result<()> {
        nix::sys::prctl::set_child_subreaper(true)
            .map_err(|e| Error::os("prctl(PR_SET_CHILD_SUBREAPER)", e))
    }

    /// Creates a container record: registry entry, owner identity,
    /// capability sanitization, initial snapshot.
    ///
    /// `check_parent` applies the caller's permission model under the
    /// registry mutex.
    ///
    /// # Errors
    ///
    /// Registry failures and snapshot write failures; a failed snapshot
    /// rolls the record back out.
    pub fn create_container(
        self: &Arc<Self>,
        name: &str,
        mut owner: Cred,
        check_parent: impl FnOnce(&Arc<Container>) -> Result<()>,
    ) -> Result<Arc<Container>> {
        if let Err(err) = owner.load_groups() {
            debug!(uid = owner.uid, %err, "cannot load owner groups");
        }
        let ct = self
            .registry
            .create(name, owner, &self.config, check_parent)?;
        info!(name, id = ct.id, "create");

        ct.set_prop(Prop::User);
        ct.set_prop(Prop::Group);
        ct.sanitize_capabilities();
        ct.set_prop(Prop::State);
        ct.set_prop(Prop::RespawnCount);

        if let Err(err) = ct.save(self) {
            self.registry.unlink(&ct);
            return Err(err);
        }
        Ok(ct)
    }

    /// Replays every persisted container, parents before children.
    ///
    /// Containers whose freezer group or wait task vanished while the
    /// daemon was down are reaped; respawnable ones are rescheduled.
    ///
    /// # Errors
    ///
    /// Fails only when the snapshot directory is unreadable; individual
    /// broken snapshots are skipped.
    pub fn restore_all(self: &Arc<Self>) -> Result<()> {
        for (file_id, record) in self.kv.load_all()? {
            let Some(name) = record.get(KEY_NAME).cloned() else {
                warn!(file_id, "snapshot without a name, skipped");
                continue;
            };
            let id: u32 = record
                .get(KEY_ID)
                .and_then(|value| value.parse().ok())
                .unwrap_or(file_id);

            let ct = match self.registry.restore(&name, id, &self.config) {
                Ok(ct) => ct,
                Err(err) => {
                    warn!(name, id, %err, "cannot restore container, skipped");
                    continue;
                }
            };
            props::load_record(&ct, &record);
            self.sync_state(&ct);

            // Replay the transition into an alive state so the
            // running-descendant counters are rebuilt on every ancestor.
            let persisted = ct.state();
            if persisted.is_alive() {
                ct.lock_inner().state = ContainerState::Stopped;
                ct.change_state(persisted, &self.wildcard_waiters);
            }

            if ct.may_respawn() {
                ct.schedule_respawn(self);
            }
            if let Err(err) = ct.save(self) {
                warn!(name = %ct.name, %err, "cannot save restored container");
            }
            info!(name = %ct.name, id = ct.id, state = %ct.state(), "restored");
        }
        Ok(())
    }

    /// Reconciles a restored record with what actually survived the
    /// daemon restart.
    fn sync_state(self: &Arc<Self>, ct: &Arc<Container>) {
        use crate::cgroup::Subsystem;

        let state = ct.state();
        let freezer = ct.cgroup(Subsystem::Freezer, &self.config);
        if !freezer.exists() {
            if state != ContainerState::Stopped {
                warn!(name = %ct.name, "freezer group is gone, marking stopped");
            }
            let mut inner = ct.lock_inner();
            inner.state = ContainerState::Stopped;
            inner.runtime.task_pid = 0;
            inner.runtime.wait_pid = 0;
            return;
        }

        let wait_pid = ct.lock_inner().runtime.wait_pid;
        match state {
            ContainerState::Stopped => {
                info!(name = %ct.name, "found unexpected freezer group, reaping");
                ct.reap_for_restore(self);
            }
            ContainerState::Meta if wait_pid == 0 => {}
            _ => {
                if wait_pid == 0 || !Path::new(&format!("/proc/{wait_pid}")).exists() {
                    info!(name = %ct.name, "wait task is gone, reaping");
                    ct.reap_for_restore(self);
                }
            }
        }
    }

    /// Arms an async watcher on the container's OOM eventfd; a fired
    /// event lands in the queue.
    pub fn watch_oom(self: &Arc<Self>, ct: &Arc<Container>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(name = %ct.name, "no runtime, OOM events will not be delivered");
            return;
        };
        let Some(fd) = ct
            .lock_inner()
            .oom_fd
            .as_ref()
            .and_then(|fd| fd.try_clone().ok())
        else {
            return;
        };
        let engine = self.clone();
        let weak = Arc::downgrade(ct);
        handle.spawn(async move {
            let Ok(async_fd) = AsyncFd::new(fd) else {
                return;
            };
            if async_fd.readable().await.is_ok() {
                engine.events.schedule(Duration::ZERO, Event::Oom { ct: weak });
            }
        });
    }

    /// One event worker: pops due events forever.
    pub async fn run_event_worker(self: Arc<Self>) {
        loop {
            let event = self.events.next().await;
            debug!(event = %event.describe(), "deliver event");
            self.dispatch_event(event).await;
        }
    }

    /// SIGCHLD reaper: collects every exited child and turns it into an
    /// Exit event.
    pub async fn run_reaper(self: Arc<Self>) {
        let mut sigchld =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child()) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%err, "cannot install SIGCHLD handler");
                    return;
                }
            };
        loop {
            sigchld.recv().await;
            loop {
                match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::Exited(pid, code)) => {
                        self.events.schedule(
                            Duration::ZERO,
                            Event::Exit {
                                pid: pid.as_raw(),
                                status: wait_status_exited(code),
                            },
                        );
                    }
                    Ok(WaitStatus::Signaled(pid, signal, _core)) => {
                        self.events.schedule(
                            Duration::ZERO,
                            Event::Exit {
                                pid: pid.as_raw(),
                                status: signal as i32,
                            },
                        );
                    }
                    Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
                    Ok(_) => {}
                    Err(errno) => {
                        warn!(%errno, "waitpid failed");
                        break;
                    }
                }
            }
        }
    }

    /// Schedules the first rotation tick; the handler re-arms itself.
    pub fn start_rotation(self: &Arc<Self>) {
        self.events
            .schedule(self.config.daemon.rotate_interval, Event::RotateLogs);
    }

    /// Delivers one event. Each kind is handled independently.
    pub async fn dispatch_event(self: &Arc<Self>, event: Event) {
        match event {
            Event::Exit { pid, status } => {
                // A pid that matches no wait task is a duplicate or a
                // stranger; both are absorbed silently.
                let target = self
                    .registry
                    .all()
                    .into_iter()
                    .find(|ct| ct.lock_inner().runtime.wait_pid == pid);
                if let Some(ct) = target {
                    self.locked_blocking(ct, move |engine, ct| {
                        ct.exit(engine, status, false);
                    })
                    .await;
                }
            }
            Event::Oom { ct } => {
                let Some(ct) = ct.upgrade() else { return };
                let deliver = {
                    let inner = ct.lock_inner();
                    inner.runtime.task_pid != 0 && inner.state != ContainerState::Dead
                };
                if deliver {
                    self.locked_blocking(ct, |engine, ct| {
                        ct.exit(engine, libc::SIGKILL, true);
                    })
                    .await;
                }
            }
            Event::Respawn { ct } => {
                let Some(ct) = ct.upgrade() else { return };
                if !ct.may_respawn() {
                    return;
                }
                self.locked_blocking(ct, |engine, ct| {
                    if ct.may_respawn() {
                        if let Err(err) = ct.respawn(engine) {
                            warn!(name = %ct.name, %err, "respawn failed");
                        }
                    }
                })
                .await;
            }
            Event::WaitTimeout { waiter } => {
                if let Some(waiter) = waiter.upgrade() {
                    waiter.wake(None);
                }
            }
            Event::DestroyWeak { ct } => {
                let Some(ct) = ct.upgrade() else { return };
                self.locked_blocking(ct, |engine, ct| {
                    if let Err(err) = ct.destroy(engine) {
                        warn!(name = %ct.name, %err, "cannot destroy weak container");
                    }
                })
                .await;
            }
            Event::RotateLogs => {
                // Snapshot first; rotation and aging must not iterate a
                // map they are shrinking.
                let snapshot = self.registry.all();
                for ct in snapshot {
                    match ct.state() {
                        ContainerState::Running => {
                            if let Ok(_guard) = self.registry.lock_read(&ct).await {
                                if ct.state() == ContainerState::Running {
                                    ct.rotate_stdio(self);
                                }
                            }
                        }
                        ContainerState::Dead if ct.expired() => {
                            info!(name = %ct.name, "aged out, destroying");
                            self.locked_blocking(ct, |engine, ct| {
                                if let Err(err) = ct.destroy(engine) {
                                    warn!(name = %ct.name, %err, "cannot destroy expired container");
                                }
                            })
                            .await;
                        }
                        _ => {}
                    }
                }
                self.start_rotation();
            }
        }
    }

    /// Write-locks `ct` and runs `work` on a blocking thread, holding
    /// the lock for the duration.
    async fn locked_blocking<F>(self: &Arc<Self>, ct: Arc<Container>, work: F)
    where
        F: FnOnce(&Arc<Engine>, &Arc<Container>) + Send + 'static,
    {
        let guard = match self.registry.lock_write(&ct).await {
            Ok(guard) => guard,
            Err(err) => {
                debug!(name = %ct.name, %err, "event target is gone");
                return;
            }
        };
        let engine = self.clone();
        let join = tokio::task::spawn_blocking(move || {
            work(&engine, &ct);
            drop(guard);
        });
        if let Err(err) = join.await {
            warn!(%err, "event worker panicked");
        }
    }
}

impl Container {
    /// Restore-time reap: no freezer manipulation, just bookkeeping, so
    /// it stays usable before the runtime is serving.
    pub(crate) fn reap_for_restore(self: &Arc<Self>, engine: &Arc<Engine>) {
        {
            let mut inner = self.lock_inner();
            inner.runtime.death_time_ms = crate::container::wall_ms();
            inner.runtime.task_pid = 0;
            inner.runtime.task_vpid = 0;
            inner.runtime.wait_pid = 0;
        }
        let next = if self.is_meta() {
            ContainerState::Stopped
        } else {
            ContainerState::Dead
        };
        self.lock_inner().state = next;
        self.set_prop(Prop::DeathTime);
        self.clear_prop(Prop::RootPid);
        self.free_resources(engine);
    }
}

/// Rebuilds a raw `waitpid` exit status from an exit code.
const fn wait_status_exited(code: i32) -> i32 {
    (code & 0xff) << 8
}

#[cfg(test)]
impl Engine {
    /// A throwaway engine rooted in a temporary directory.
    pub(crate) fn for_tests() -> Arc<Self> {
        let dir = tempfile::tempdir()
            .expect("create test dir")
            .keep();
        let config = DaemonConfig {
            socket_path: dir.join("warrend.sock"),
            keyvalue_dir: dir.join("state"),
            tmp_dir: dir.join("work"),
            volumes_dir: dir.join("volumes"),
            cgroup_root: dir.join("cgroup"),
            ..DaemonConfig::default()
        };
        Self::new(config).expect("build test engine")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_saves_snapshot() {
        let engine = Engine::for_tests();
        let ct = engine
            .create_container("a", Cred::new(1000, 1000), |_| Ok(()))
            .unwrap();
        let record = engine.kv.load(ct.id).unwrap();
        assert_eq!(record[KEY_NAME], "a");
        assert_eq!(record["state"], "stopped");
    }

    #[test]
    fn restore_rebuilds_tree() {
        let engine = Engine::for_tests();
        let a = engine
            .create_container("a", Cred::new(0, 0), |_| Ok(()))
            .unwrap();
        props::set_property(&a, &engine, "command", "/bin/true").unwrap();
        let b = engine
            .create_container("a/b", Cred::new(0, 0), |_| Ok(()))
            .unwrap();
        let (a_id, b_id) = (a.id, b.id);

        let second = Engine::new(engine.config.clone()).unwrap();
        second.restore_all().unwrap();

        let a2 = second.registry.resolve("a").unwrap();
        let b2 = second.registry.resolve("a/b").unwrap();
        assert_eq!(a2.id, a_id);
        assert_eq!(b2.id, b_id);
        assert_eq!(a2.lock_inner().spec.command, "/bin/true");
        assert!(std::sync::Arc::ptr_eq(&b2.parent().unwrap(), &a2));
        assert_eq!(a2.state(), ContainerState::Stopped);
    }

    #[test]
    fn exit_status_helper() {
        assert_eq!(wait_status_exited(0), 0);
        assert_eq!(wait_status_exited(1), 0x100);
        assert!(libc::WIFEXITED(wait_status_exited(3)));
        assert_eq!(libc::WEXITSTATUS(wait_status_exited(3)), 3);
    }

    #[tokio::test]
    async fn wait_timeout_event_wakes_waiter() {
        let engine = Engine::for_tests();
        let (waiter, mut rx) = crate::waiter::Waiter::new(String::new(), Vec::new());
        engine
            .dispatch_event(Event::WaitTimeout {
                waiter: Arc::downgrade(&waiter),
            })
            .await;
        let result = rx.try_recv().unwrap();
        assert!(result.name.is_empty());
    }

    #[tokio::test]
    async fn exit_event_for_unknown_pid_is_absorbed() {
        let engine = Engine::for_tests();
        engine
            .dispatch_event(Event::Exit {
                pid: 999_999,
                status: 0,
            })
            .await;
    }
}
