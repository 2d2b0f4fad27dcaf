//! Client identification and the permission model.
//!
//! Every accepted connection is identified from its kernel-reported peer
//! credentials: the peer pid locates the client's own container through
//! its freezer cgroup, which fixes the credentials the client acts with
//! and its effective access level. Identity is re-checked on every
//! request so a socket smuggled across a container boundary does not
//! keep its old powers.

use std::sync::Arc;

use tokio::net::UnixStream;
use tracing::warn;
use warren_core::cgroup::{Subsystem, CGROUP_PREFIX};
use warren_core::container::Container;
use warren_core::cred::{
    group_id, AccessLevel, Cred, DAEMON_GROUP, SHARED_CT_GROUP, USER_CT_SUFFIX,
};
use warren_core::error::{Error, ErrorKind, Result};
use warren_core::name::{compose_name, resolve_name};
use warren_core::Engine;

/// Raw peer credentials from `SO_PEERCRED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCred {
    /// Peer uid.
    pub uid: u32,
    /// Peer gid.
    pub gid: u32,
    /// Peer pid; absent only on exotic transports.
    pub pid: Option<i32>,
}

impl PeerCred {
    /// Reads the peer credentials off a connected stream.
    ///
    /// # Errors
    ///
    /// Propagates the sockopt failure.
    pub fn from_stream(stream: &UnixStream) -> Result<Self> {
        let cred = stream.peer_cred().map_err(Error::from)?;
        Ok(Self {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid(),
        })
    }
}

/// A fully derived client identity.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Credentials requests are executed with: the peer's own for root
    /// container clients, the owner's for containerized clients.
    pub cred: Cred,
    /// Effective access level after ancestor clamping.
    pub access_level: AccessLevel,
    /// The container the client lives in.
    pub container: Arc<Container>,
    /// Peer credentials the identity was derived from.
    pub peer: PeerCred,
    /// Peer comm, for logs.
    pub comm: String,
}

impl ClientIdentity {
    /// Identifies a peer.
    ///
    /// # Errors
    ///
    /// `Permission` when the client's container disables the API or is
    /// not running; lookup failures as `Unknown`.
    pub fn identify(engine: &Arc<Engine>, peer: PeerCred) -> Result<Self> {
        let pid = peer
            .pid
            .ok_or_else(|| Error::new(ErrorKind::Unknown, "peer has no pid"))?;

        let container = find_task_container(engine, pid)?;

        let mut access_level = container.lock_inner().spec.access_level;
        for ancestor in container.ancestors() {
            access_level = access_level.min(ancestor.lock_inner().spec.access_level);
        }
        if access_level == AccessLevel::None {
            return Err(Error::new(
                ErrorKind::Permission,
                format!("management API disabled in container {}", container.name),
            ));
        }
        if !container.state().is_alive() {
            return Err(Error::new(
                ErrorKind::Permission,
                format!("client from container in state {}", container.state()),
            ));
        }

        let cred = if container.is_root() {
            let mut cred = Cred::new(peer.uid, peer.gid);
            cred.groups = proc_groups(pid).unwrap_or_else(|err| {
                warn!(pid, %err, "cannot read supplementary groups");
                Vec::new()
            });
            cred
        } else {
            // Requests from containers run on behalf of their owners.
            container.lock_inner().spec.owner.clone()
        };

        if cred.is_root() {
            if access_level == AccessLevel::Normal {
                access_level = AccessLevel::SuperUser;
            }
        } else if !group_id(DAEMON_GROUP).is_some_and(|gid| cred.is_member_of(gid))
            && access_level >= AccessLevel::ReadOnly
        {
            access_level = AccessLevel::ReadOnly;
        }

        let comm = std::fs::read_to_string(format!("/proc/{pid}/comm"))
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|_| "<unknown process>".to_string());

        Ok(Self {
            cred,
            access_level,
            container,
            peer,
            comm,
        })
    }

    /// True while a previously derived identity still covers the peer:
    /// same pid/uid/gid and a still-running client container.
    #[must_use]
    pub fn still_valid(&self, peer: &PeerCred) -> bool {
        self.peer == *peer && self.container.state().is_alive()
    }

    /// True for superuser-or-better clients.
    #[must_use]
    pub fn is_superuser(&self) -> bool {
        self.access_level >= AccessLevel::SuperUser
    }

    /// The namespace prefix request names resolve against.
    #[must_use]
    pub fn namespace(&self) -> String {
        self.container.namespace()
    }

    /// Resolves a request-supplied name into an absolute one.
    ///
    /// # Errors
    ///
    /// `Permission` when an absolute name escapes the namespace.
    pub fn resolve(&self, relative: &str) -> Result<String> {
        resolve_name(relative, &self.namespace(), &self.container.name)
    }

    /// Expresses an absolute name in the client's namespace.
    ///
    /// # Errors
    ///
    /// `Permission` when the container is not reachable from it.
    pub fn compose(&self, name: &str) -> Result<String> {
        compose_name(name, &self.namespace())
    }

    /// Checks write access to a container owned by `other`.
    ///
    /// # Errors
    ///
    /// `Permission` when the identity may not manage such containers.
    pub fn can_control_cred(&self, other: &Cred) -> Result<()> {
        if self.access_level <= AccessLevel::ReadOnly {
            return Err(Error::new(ErrorKind::Permission, "no write access at all"));
        }
        if self.is_superuser() || self.cred.uid == other.uid {
            return Ok(());
        }
        // Anybody with write access may manage the shared delegation
        // group; a user's personal "<user>-containers" group delegates
        // to that user only.
        if group_id(SHARED_CT_GROUP).is_some_and(|gid| other.is_member_of(gid)) {
            return Ok(());
        }
        let personal = format!("{}{}", self.cred.user_name(), USER_CT_SUFFIX);
        if group_id(&personal).is_some_and(|gid| other.is_member_of(gid)) {
            return Ok(());
        }
        Err(Error::new(
            ErrorKind::Permission,
            format!("user {} cannot control {}", self.cred, other),
        ))
    }

    /// Checks write access to `ct`. With `child`, the check is for
    /// creating a child under `ct` rather than touching `ct` itself.
    ///
    /// # Errors
    ///
    /// `Permission` per the owner rules and the child-only scope.
    pub fn can_control(&self, ct: &Arc<Container>, child: bool) -> Result<()> {
        if self.access_level < AccessLevel::ChildOnly {
            return Err(Error::new(ErrorKind::Permission, "no write access at all"));
        }
        if !child && ct.is_root() {
            return Err(Error::new(ErrorKind::Permission, "the root container is read-only"));
        }
        // The owner rule applies to child creation too: under the root,
        // whose owner is root, only superusers may open new top-level
        // subtrees.
        self.can_control_cred(&ct.lock_inner().spec.owner)?;
        if self.access_level > AccessLevel::ChildOnly {
            return Ok(());
        }

        // Child-only clients may only touch the subtree below their
        // nearest child-only ancestor.
        let mut base = Some(self.container.clone());
        while let Some(ct) = &base {
            if ct.lock_inner().spec.access_level == AccessLevel::ChildOnly {
                break;
            }
            base = ct.parent();
        }
        let base = base.ok_or_else(|| {
            Error::new(ErrorKind::Permission, "child-only scope has no base container")
        })?;

        if (child && Arc::ptr_eq(&base, ct)) || ct.is_child_of(&base) {
            return Ok(());
        }
        Err(Error::new(
            ErrorKind::Permission,
            format!("not a child container: {}", ct.name),
        ))
    }
}

/// Finds the container a task lives in via its freezer cgroup.
fn find_task_container(engine: &Arc<Engine>, pid: i32) -> Result<Arc<Container>> {
    let cgroup_path = Subsystem::Freezer.task_cgroup(pid)?;

    // Match on whole path components; a stranger branch that merely
    // shares the prefix string is still the root container's problem.
    if cgroup_path == CGROUP_PREFIX {
        return Ok(engine.registry.root());
    }
    match cgroup_path.strip_prefix(CGROUP_PREFIX) {
        Some(rest) if rest.starts_with('/') => {
            engine.registry.resolve(rest.trim_start_matches('/'))
        }
        _ => Ok(engine.registry.root()),
    }
}

/// Supplementary groups of a live task, from `/proc/<pid>/status`.
fn proc_groups(pid: i32) -> Result<Vec<u32>> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).map_err(Error::from)?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Groups:") {
            return Ok(rest
                .split_whitespace()
                .filter_map(|g| g.parse().ok())
                .collect());
        }
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_groups_parse() {
        let groups = proc_groups(std::process::id() as i32).unwrap();
        // Any process has a Groups line, possibly empty.
        let _ = groups;
    }

    #[test]
    fn peer_cred_from_socketpair() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (a, _b) = UnixStream::pair().unwrap();
            let peer = PeerCred::from_stream(&a).unwrap();
            assert_eq!(peer.uid, nix::unistd::getuid().as_raw());
            assert_eq!(peer.pid, Some(std::process::id() as i32));
        });
    }
}
