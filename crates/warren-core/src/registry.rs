//! The container registry and its hierarchical locks.
//!
//! One mutex guards the name map, the id allocator and every per-record
//! lock word. A lock on a container implicitly read-locks all ancestors:
//! the lock word counts +1 per reader and -1 for a writer, and taking any
//! lock bumps each ancestor by +1. Writers need the whole chain free of
//! writers and the target free of readers; readers only need the chain
//! free of writers. Blocked acquisitions park on a notifier that release
//! wakes, which keeps lock waits off the runtime threads.
//!
//! Lock order elsewhere in the engine: this mutex first, then at most one
//! container lock, then per-session state. Container `Inner` mutexes are
//! leaves and never held across an await.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use crate::config::{DaemonConfig, NR_SERVICE_CONTAINERS};
use crate::container::Container;
use crate::cred::Cred;
use crate::error::{Error, ErrorKind, Result};
use crate::idmap::IdMap;
use crate::name::{parent_name, valid_name, ROOT_CONTAINER};
use crate::state::ContainerState;

/// Largest id the allocator hands out.
pub const CONTAINER_ID_MAX: u32 = 16384;

struct RegistryState {
    map: HashMap<String, Arc<Container>>,
    idmap: IdMap,
}

/// The process-wide container registry.
pub struct Registry {
    state: Mutex<RegistryState>,
    unlocked: Notify,
    root: Arc<Container>,
}

impl Registry {
    /// Creates a registry holding only the root container.
    #[must_use]
    pub fn new(config: &DaemonConfig) -> Self {
        let mut idmap = IdMap::new(1, CONTAINER_ID_MAX);
        let root_id = idmap.acquire().expect("fresh idmap cannot be empty");
        let root = Container::new(None, ROOT_CONTAINER, root_id, config);
        {
            let mut inner = root.lock_inner();
            inner.state = ContainerState::Meta;
            inner.spec.owner = Cred::new(0, 0);
        }
        let mut map = HashMap::new();
        map.insert(ROOT_CONTAINER.to_string(), root.clone());
        Self {
            state: Mutex::new(RegistryState { map, idmap }),
            unlocked: Notify::new(),
            root,
        }
    }

    /// The root container.
    #[must_use]
    pub fn root(&self) -> Arc<Container> {
        self.root.clone()
    }

    /// Looks a container up by absolute name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<Container>> {
        self.state
            .lock()
            .expect("registry poisoned")
            .map
            .get(name)
            .cloned()
    }

    /// Like [`find`](Self::find) but failing with `ContainerDoesNotExist`.
    ///
    /// # Errors
    ///
    /// Returns `ContainerDoesNotExist` when the name is absent.
    pub fn resolve(&self, name: &str) -> Result<Arc<Container>> {
        self.find(name).ok_or_else(|| {
            Error::new(
                ErrorKind::ContainerDoesNotExist,
                format!("container {name} not found"),
            )
        })
    }

    /// All absolute names, sorted, the root excluded.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let state = self.state.lock().expect("registry poisoned");
        let mut names: Vec<_> = state
            .map
            .keys()
            .filter(|name| name.as_str() != ROOT_CONTAINER)
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Every record, the root included, in no particular order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Container>> {
        self.state
            .lock()
            .expect("registry poisoned")
            .map
            .values()
            .cloned()
            .collect()
    }

    /// Number of records, the root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("registry poisoned").map.len()
    }

    /// True when only the root exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Creates a container record in Stopped state.
    ///
    /// `check_parent` runs under the registry mutex with the resolved
    /// parent and is where the caller applies its permission model.
    ///
    /// # Errors
    ///
    /// `InvalidValue` for bad names or exceeded depth,
    /// `ContainerAlreadyExists`, `ResourceNotAvailable` past the container
    /// or id budget, `ContainerDoesNotExist` for a missing parent, plus
    /// whatever `check_parent` returns.
    pub fn create(
        &self,
        name: &str,
        owner: Cred,
        config: &DaemonConfig,
        check_parent: impl FnOnce(&Arc<Container>) -> Result<()>,
    ) -> Result<Arc<Container>> {
        valid_name(name, config.container.name_max, config.container.component_max)?;
        if name == ROOT_CONTAINER {
            return Err(Error::new(
                ErrorKind::Permission,
                "the root container is not yours to create",
            ));
        }

        let mut state = self.state.lock().expect("registry poisoned");
        if state.map.contains_key(name) {
            return Err(Error::new(
                ErrorKind::ContainerAlreadyExists,
                format!("container {name} already exists"),
            ));
        }
        if state.map.len() >= config.container.max_total + NR_SERVICE_CONTAINERS {
            return Err(Error::new(
                ErrorKind::ResourceNotAvailable,
                format!("container number limit {} reached", config.container.max_total),
            ));
        }

        let parent = state.map.get(&parent_name(name)).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::ContainerDoesNotExist,
                format!("parent container not found for {name}"),
            )
        })?;
        if parent.level >= config.container.level_max {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("maximum nesting level is {}", config.container.level_max),
            ));
        }
        check_parent(&parent)?;

        let id = state.idmap.acquire()?;
        let ct = Container::new(Some(&parent), name, id, config);
        ct.lock_inner().spec.owner = owner;
        state.map.insert(name.to_string(), ct.clone());
        parent.lock_inner().children.push(ct.clone());
        debug!(name, id, "created container");
        Ok(ct)
    }

    /// Recreates a record with a persisted id during startup replay.
    ///
    /// # Errors
    ///
    /// As [`create`](Self::create), with `Busy` when the persisted id is
    /// already taken.
    pub fn restore(&self, name: &str, id: u32, config: &DaemonConfig) -> Result<Arc<Container>> {
        valid_name(name, config.container.name_max, config.container.component_max)?;
        let mut state = self.state.lock().expect("registry poisoned");
        if state.map.contains_key(name) {
            return Err(Error::new(
                ErrorKind::ContainerAlreadyExists,
                format!("container {name} already exists"),
            ));
        }
        let parent = state.map.get(&parent_name(name)).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::ContainerDoesNotExist,
                format!("parent container not found for {name}"),
            )
        })?;
        state.idmap.acquire_at(id)?;
        let ct = Container::new(Some(&parent), name, id, config);
        state.map.insert(name.to_string(), ct.clone());
        parent.lock_inner().children.push(ct.clone());
        debug!(name, id, "restored container");
        Ok(ct)
    }

    /// Unlinks a record: releases the id, removes it from the map and from
    /// its parent's children, marks it Destroyed and wakes lock waiters.
    ///
    /// The caller must hold the write lock and have stopped the container.
    pub fn unlink(&self, ct: &Arc<Container>) {
        let mut state = self.state.lock().expect("registry poisoned");
        if let Err(err) = state.idmap.release(ct.id) {
            tracing::warn!(id = ct.id, %err, "cannot release container id");
        }
        state.map.remove(&ct.name);
        if let Some(parent) = ct.parent() {
            parent
                .lock_inner()
                .children
                .retain(|child| !Arc::ptr_eq(child, ct));
        }
        drop(state);
        self.unlocked.notify_waiters();
    }

    /// Takes the exclusive lock on `ct`, waiting as needed.
    ///
    /// # Errors
    ///
    /// Returns `ContainerDoesNotExist` if the record is destroyed while
    /// waiting.
    pub async fn lock_write(self: &Arc<Self>, ct: &Arc<Container>) -> Result<ContainerLock> {
        self.lock(ct, false, false).await
    }

    /// Takes a shared lock on `ct`, waiting as needed.
    ///
    /// # Errors
    ///
    /// Returns `ContainerDoesNotExist` if the record is destroyed while
    /// waiting.
    pub async fn lock_read(self: &Arc<Self>, ct: &Arc<Container>) -> Result<ContainerLock> {
        self.lock(ct, true, false).await
    }

    /// Non-blocking exclusive lock.
    ///
    /// # Errors
    ///
    /// `Busy` when the lock cannot be taken immediately.
    pub async fn try_lock_write(self: &Arc<Self>, ct: &Arc<Container>) -> Result<ContainerLock> {
        self.lock(ct, false, true).await
    }

    async fn lock(
        self: &Arc<Self>,
        ct: &Arc<Container>,
        shared: bool,
        try_lock: bool,
    ) -> Result<ContainerLock> {
        loop {
            let notified = self.unlocked.notified();
            tokio::pin!(notified);
            {
                let _state = self.state.lock().expect("registry poisoned");
                if ct.state() == ContainerState::Destroyed {
                    return Err(Error::new(
                        ErrorKind::ContainerDoesNotExist,
                        "container was destroyed",
                    ));
                }

                let word = ct.locked.load(Ordering::Relaxed);
                let mut busy = word != 0 && (word < 0 || !shared);
                if !busy {
                    for ancestor in ct.ancestors() {
                        if ancestor.locked.load(Ordering::Relaxed) < 0 {
                            busy = true;
                            break;
                        }
                    }
                }

                if !busy {
                    ct.locked
                        .store(word + if shared { 1 } else { -1 }, Ordering::Relaxed);
                    for ancestor in ct.ancestors() {
                        ancestor.locked.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(name = %ct.name, shared, "locked container");
                    return Ok(ContainerLock {
                        registry: self.clone(),
                        ct: ct.clone(),
                        shared,
                    });
                }

                if try_lock {
                    return Err(Error::new(
                        ErrorKind::Busy,
                        format!("container is busy: {}", ct.name),
                    ));
                }
                notified.as_mut().enable();
            }
            notified.as_mut().await;
        }
    }

    fn release(&self, ct: &Arc<Container>, shared: bool) {
        {
            let _state = self.state.lock().expect("registry poisoned");
            ct.locked
                .fetch_add(if shared { -1 } else { 1 }, Ordering::Relaxed);
            for ancestor in ct.ancestors() {
                ancestor.locked.fetch_sub(1, Ordering::Relaxed);
            }
        }
        debug!(name = %ct.name, shared, "unlocked container");
        // Not the most precise wakeup, but simple and starvation-free.
        self.unlocked.notify_waiters();
    }
}

/// RAII guard for a held container lock.
pub struct ContainerLock {
    registry: Arc<Registry>,
    ct: Arc<Container>,
    shared: bool,
}

impl ContainerLock {
    /// The locked container.
    #[must_use]
    pub fn container(&self) -> &Arc<Container> {
        &self.ct
    }

    /// True for a shared (read) lock.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared
    }
}

impl Drop for ContainerLock {
    fn drop(&mut self) {
        self.registry.release(&self.ct, self.shared);
    }
}

impl std::fmt::Debug for ContainerLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerLock")
            .field("name", &self.ct.name)
            .field("shared", &self.shared)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (Arc<Registry>, DaemonConfig) {
        let config = DaemonConfig::default();
        (Arc::new(Registry::new(&config)), config)
    }

    fn create(registry: &Registry, config: &DaemonConfig, name: &str) -> Arc<Container> {
        registry
            .create(name, Cred::new(0, 0), config, |_| Ok(()))
            .unwrap()
    }

    #[test]
    fn create_builds_topology() {
        let (registry, config) = registry();
        let a = create(&registry, &config, "a");
        let b = create(&registry, &config, "a/b");
        assert!(Arc::ptr_eq(&b.parent().unwrap(), &a));
        assert_eq!(registry.names(), vec!["a".to_string(), "a/b".to_string()]);
        assert_eq!(a.children().len(), 1);
    }

    #[test]
    fn create_failure_modes() {
        let (registry, config) = registry();
        create(&registry, &config, "a");

        let err = registry
            .create("a", Cred::new(0, 0), &config, |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContainerAlreadyExists);

        let err = registry
            .create("missing/child", Cred::new(0, 0), &config, |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContainerDoesNotExist);

        let err = registry
            .create("bad//name", Cred::new(0, 0), &config, |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);

        let err = registry
            .create("b", Cred::new(0, 0), &config, |_| {
                Err(Error::new(ErrorKind::Permission, "no"))
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Permission);
        assert!(registry.find("b").is_none());
    }

    #[test]
    fn create_respects_depth_limit() {
        let (registry, mut config) = registry();
        config.container.level_max = 2;
        create(&registry, &config, "a");
        create(&registry, &config, "a/b");
        let err = registry
            .create("a/b/c", Cred::new(0, 0), &config, |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);
    }

    #[test]
    fn create_respects_total_limit() {
        let (registry, mut config) = registry();
        config.container.max_total = 2;
        // Root plus NR_SERVICE_CONTAINERS headroom on top of max_total.
        for i in 0..(config.container.max_total + NR_SERVICE_CONTAINERS - 1) {
            create(&registry, &config, &format!("c{i}"));
        }
        let err = registry
            .create("straw", Cred::new(0, 0), &config, |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceNotAvailable);
    }

    #[test]
    fn unlink_releases_name_and_id() {
        let (registry, config) = registry();
        let a = create(&registry, &config, "a");
        let id = a.id;
        registry.unlink(&a);
        assert!(registry.find("a").is_none());
        let again = create(&registry, &config, "a");
        assert_eq!(again.id, id);
    }

    #[test]
    fn restore_uses_persisted_id() {
        let (registry, config) = registry();
        let ct = registry.restore("a", 42, &config).unwrap();
        assert_eq!(ct.id, 42);
        let err = registry.restore("b", 42, &config).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);
    }

    #[tokio::test]
    async fn write_lock_excludes_second_writer() {
        let (registry, config) = registry();
        let a = create(&registry, &config, "a");
        let guard = registry.lock_write(&a).await.unwrap();
        let err = registry.try_lock_write(&a).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);
        drop(guard);
        let _second = registry.try_lock_write(&a).await.unwrap();
    }

    #[tokio::test]
    async fn write_lock_implies_ancestor_read_locks() {
        let (registry, config) = registry();
        let a = create(&registry, &config, "a");
        let b = create(&registry, &config, "a/b");

        let guard = registry.lock_write(&b).await.unwrap();
        // The ancestor is read-locked: writers blocked, readers fine.
        let err = registry.try_lock_write(&a).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);
        let read = registry.lock_read(&a).await.unwrap();
        drop(read);
        drop(guard);
        let _now = registry.try_lock_write(&a).await.unwrap();
    }

    #[tokio::test]
    async fn unrelated_containers_do_not_block() {
        let (registry, config) = registry();
        let a = create(&registry, &config, "a");
        let b = create(&registry, &config, "b");
        let _guard = registry.lock_write(&a).await.unwrap();
        let _other = registry.try_lock_write(&b).await.unwrap();
    }

    #[tokio::test]
    async fn readers_share() {
        let (registry, config) = registry();
        let a = create(&registry, &config, "a");
        let first = registry.lock_read(&a).await.unwrap();
        let second = registry.lock_read(&a).await.unwrap();
        assert!(first.is_shared() && second.is_shared());
        // A writer must wait for both.
        let err = registry.try_lock_write(&a).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);
    }

    #[tokio::test]
    async fn blocked_writer_wakes_on_release() {
        let (registry, config) = registry();
        let a = create(&registry, &config, "a");
        let guard = registry.lock_write(&a).await.unwrap();

        let registry2 = registry.clone();
        let a2 = a.clone();
        let waiter = tokio::spawn(async move { registry2.lock_write(&a2).await });
        tokio::task::yield_now().await;
        drop(guard);
        let lock = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("writer should wake")
            .unwrap()
            .unwrap();
        assert!(!lock.is_shared());
    }

    #[tokio::test]
    async fn lock_fails_on_destroyed() {
        let (registry, config) = registry();
        let a = create(&registry, &config, "a");
        a.lock_inner().state = ContainerState::Destroyed;
        let err = registry.lock_write(&a).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContainerDoesNotExist);
    }
}
