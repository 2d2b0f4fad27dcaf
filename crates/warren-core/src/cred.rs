//! Credentials and API access levels.
//!
//! A [`Cred`] captures uid, gid and supplementary groups of either a peer
//! process or a container owner. [`AccessLevel`] grades what the holder may
//! do through the API; levels only ever decrease along the container
//! parent chain.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Group whose members get full (non-clamped) API access.
pub const DAEMON_GROUP: &str = "warren";
/// Owners in this group can be controlled by anybody with write access.
pub const SHARED_CT_GROUP: &str = "warren-containers";
/// Suffix of the per-user delegation group, `<user>-containers`.
pub const USER_CT_SUFFIX: &str = "-containers";

/// What a client or a container's inhabitants may do via the API.
///
/// The ordering is meaningful: effective access is the minimum along the
/// ancestor chain, except that `ChildOnly` scopes later relaxations to the
/// subtree below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// All requests fail with Permission.
    None,
    /// Read-only introspection.
    ReadOnly,
    /// May manage only descendants of the level-defining container.
    ChildOnly,
    /// Regular management access.
    Normal,
    /// Full control over every container.
    SuperUser,
    /// Daemon-internal pseudo-client, bypasses checks.
    Internal,
}

impl AccessLevel {
    /// Parses the wire spelling.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for unknown names.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(Self::None),
            "read_only" | "read-only" => Ok(Self::ReadOnly),
            "child_only" | "child-only" => Ok(Self::ChildOnly),
            "normal" => Ok(Self::Normal),
            "super_user" | "super" => Ok(Self::SuperUser),
            _ => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown access level '{name}'"),
            )),
        }
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::ReadOnly => "read_only",
            Self::ChildOnly => "child_only",
            Self::Normal => "normal",
            Self::SuperUser => "super_user",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// A user identity: uid, gid and supplementary groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cred {
    /// User id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
    /// Supplementary group ids.
    #[serde(default)]
    pub groups: Vec<u32>,
}

impl Cred {
    /// Creates a credential without supplementary groups.
    #[must_use]
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    /// True for uid 0.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// True if `gid` is the primary or a supplementary group.
    #[must_use]
    pub fn is_member_of(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }

    /// Resolves the user name for this uid, falling back to the number.
    #[must_use]
    pub fn user_name(&self) -> String {
        nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(self.uid))
            .ok()
            .flatten()
            .map_or_else(|| self.uid.to_string(), |u| u.name)
    }

    /// Reloads supplementary groups from the passwd database.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` when the user has no passwd entry.
    pub fn load_groups(&mut self) -> Result<()> {
        let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(self.uid))
            .map_err(Error::from)?
            .ok_or_else(|| {
                Error::new(ErrorKind::InvalidValue, format!("no passwd entry for uid {}", self.uid))
            })?;
        let name = std::ffi::CString::new(user.name.as_str())
            .map_err(|_| Error::new(ErrorKind::InvalidValue, "user name contains NUL"))?;
        let groups =
            nix::unistd::getgrouplist(&name, nix::unistd::Gid::from_raw(self.gid))
                .map_err(Error::from)?;
        self.groups = groups.into_iter().map(nix::unistd::Gid::as_raw).collect();
        Ok(())
    }
}

impl std::fmt::Display for Cred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Looks up a group id by name.
#[must_use]
pub fn group_id(name: &str) -> Option<u32> {
    nix::unistd::Group::from_name(name)
        .ok()
        .flatten()
        .map(|g| g.gid.as_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_level_ordering() {
        assert!(AccessLevel::None < AccessLevel::ReadOnly);
        assert!(AccessLevel::ReadOnly < AccessLevel::ChildOnly);
        assert!(AccessLevel::ChildOnly < AccessLevel::Normal);
        assert!(AccessLevel::Normal < AccessLevel::SuperUser);
        assert!(AccessLevel::SuperUser < AccessLevel::Internal);
    }

    #[test]
    fn access_level_names() {
        for level in [
            AccessLevel::None,
            AccessLevel::ReadOnly,
            AccessLevel::ChildOnly,
            AccessLevel::Normal,
            AccessLevel::SuperUser,
        ] {
            assert_eq!(AccessLevel::parse(&level.to_string()).unwrap(), level);
        }
        assert!(AccessLevel::parse("internal").is_err());
    }

    #[test]
    fn membership() {
        let cred = Cred {
            uid: 1000,
            gid: 1000,
            groups: vec![4, 27],
        };
        assert!(cred.is_member_of(1000));
        assert!(cred.is_member_of(27));
        assert!(!cred.is_member_of(5));
        assert!(!cred.is_root());
        assert!(Cred::new(0, 0).is_root());
    }
}
