//! Volume storage, plain-directory backend.
//!
//! Volumes are named directories under the volumes root. Containers link
//! to volumes; a volume with no remaining links is destroyed. A container
//! whose `root` points at a volume path gets that directory bound as its
//! root mount at start.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::cred::Cred;
use crate::error::{Error, ErrorKind, Result};

/// One volume: a directory plus its container links.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    /// Directory backing the volume.
    pub path: PathBuf,
    /// Owner at creation time.
    pub owner: Cred,
    /// Absolute names of linked containers.
    pub links: Vec<String>,
}

/// The volume table.
#[derive(Debug)]
pub struct VolumeRegistry {
    dir: PathBuf,
    volumes: Mutex<HashMap<PathBuf, VolumeInfo>>,
    next: std::sync::atomic::AtomicU64,
}

impl VolumeRegistry {
    /// Opens (and creates) the volumes root.
    ///
    /// # Errors
    ///
    /// Propagates directory creation failures.
    pub fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .map_err(|e| Error::from(e).context(format!("mkdir {}", dir.display())))?;
        Ok(Self {
            dir,
            volumes: Mutex::new(HashMap::new()),
            next: std::sync::atomic::AtomicU64::new(1),
        })
    }

    /// Creates a volume, optionally at a caller-provided path, linked to
    /// `link` if given.
    ///
    /// # Errors
    ///
    /// `ContainerAlreadyExists` flavor errors become `Busy`; filesystem
    /// failures keep their errno.
    pub fn create(
        &self,
        path: Option<PathBuf>,
        owner: Cred,
        link: Option<String>,
    ) -> Result<VolumeInfo> {
        let path = match path {
            Some(path) => {
                if !path.is_absolute() {
                    return Err(Error::new(ErrorKind::InvalidValue, "volume path must be absolute"));
                }
                path
            }
            None => {
                let seq = self
                    .next
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.dir.join(format!("volume-{seq}"))
            }
        };

        let mut volumes = self.volumes.lock().expect("volumes poisoned");
        if volumes.contains_key(&path) {
            return Err(Error::new(
                ErrorKind::Busy,
                format!("volume {} already exists", path.display()),
            ));
        }
        fs::create_dir_all(&path).map_err(Error::from)?;
        nix::unistd::chown(
            &path,
            Some(nix::unistd::Uid::from_raw(owner.uid)),
            Some(nix::unistd::Gid::from_raw(owner.gid)),
        )
        .map_err(Error::from)?;

        let info = VolumeInfo {
            path: path.clone(),
            owner,
            links: link.into_iter().collect(),
        };
        volumes.insert(path, info.clone());
        info!(path = %info.path.display(), "created volume");
        Ok(info)
    }

    /// Looks a volume up by path.
    #[must_use]
    pub fn find(&self, path: &Path) -> Option<VolumeInfo> {
        self.volumes
            .lock()
            .expect("volumes poisoned")
            .get(path)
            .cloned()
    }

    /// Adds a container link.
    ///
    /// # Errors
    ///
    /// `ContainerDoesNotExist` flavor: unknown volume path.
    pub fn link(&self, path: &Path, container: &str) -> Result<()> {
        let mut volumes = self.volumes.lock().expect("volumes poisoned");
        let info = volumes.get_mut(path).ok_or_else(|| {
            Error::new(ErrorKind::InvalidValue, format!("no volume at {}", path.display()))
        })?;
        if !info.links.iter().any(|l| l == container) {
            info.links.push(container.to_string());
        }
        Ok(())
    }

    /// Drops a container link; destroys the volume when the last link
    /// goes.
    ///
    /// # Errors
    ///
    /// `InvalidValue` for an unknown volume.
    pub fn unlink(&self, path: &Path, container: &str) -> Result<()> {
        let destroy = {
            let mut volumes = self.volumes.lock().expect("volumes poisoned");
            let info = volumes.get_mut(path).ok_or_else(|| {
                Error::new(ErrorKind::InvalidValue, format!("no volume at {}", path.display()))
            })?;
            info.links.retain(|l| l != container);
            if info.links.is_empty() {
                volumes.remove(path);
                true
            } else {
                false
            }
        };
        if destroy {
            self.destroy_dir(path);
        }
        Ok(())
    }

    /// Drops every link held by `container`, destroying orphaned volumes.
    pub fn unlink_all(&self, container: &str) {
        let orphans: Vec<PathBuf> = {
            let mut volumes = self.volumes.lock().expect("volumes poisoned");
            let mut orphans = Vec::new();
            volumes.retain(|path, info| {
                info.links.retain(|l| l != container);
                if info.links.is_empty() {
                    orphans.push(path.clone());
                    false
                } else {
                    true
                }
            });
            orphans
        };
        for path in orphans {
            self.destroy_dir(&path);
        }
    }

    /// Paths of all volumes, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<VolumeInfo> {
        let volumes = self.volumes.lock().expect("volumes poisoned");
        let mut list: Vec<_> = volumes.values().cloned().collect();
        list.sort_by(|a, b| a.path.cmp(&b.path));
        list
    }

    fn destroy_dir(&self, path: &Path) {
        // Only remove storage the registry itself allocated.
        if path.starts_with(&self.dir) {
            if let Err(err) = fs::remove_dir_all(path) {
                warn!(path = %path.display(), %err, "cannot remove volume storage");
            }
        }
        info!(path = %path.display(), "destroyed volume");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (VolumeRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (
            VolumeRegistry::open(dir.path().join("volumes")).unwrap(),
            dir,
        )
    }

    #[test]
    fn create_and_find() {
        let (volumes, _dir) = registry();
        let info = volumes
            .create(None, Cred::default(), Some("a".to_string()))
            .unwrap();
        assert!(info.path.is_dir());
        assert_eq!(volumes.find(&info.path).unwrap().links, vec!["a"]);
    }

    #[test]
    fn unlink_last_destroys() {
        let (volumes, _dir) = registry();
        let info = volumes
            .create(None, Cred::default(), Some("a".to_string()))
            .unwrap();
        volumes.link(&info.path, "b").unwrap();
        volumes.unlink(&info.path, "a").unwrap();
        assert!(volumes.find(&info.path).is_some());
        volumes.unlink(&info.path, "b").unwrap();
        assert!(volumes.find(&info.path).is_none());
        assert!(!info.path.exists());
    }

    #[test]
    fn unlink_all_for_container() {
        let (volumes, _dir) = registry();
        let v1 = volumes
            .create(None, Cred::default(), Some("a".to_string()))
            .unwrap();
        let v2 = volumes
            .create(None, Cred::default(), Some("a".to_string()))
            .unwrap();
        volumes.link(&v2.path, "b").unwrap();
        volumes.unlink_all("a");
        assert!(volumes.find(&v1.path).is_none());
        assert_eq!(volumes.find(&v2.path).unwrap().links, vec!["b"]);
    }

    #[test]
    fn rejects_relative_path() {
        let (volumes, _dir) = registry();
        assert!(volumes
            .create(Some(PathBuf::from("rel/path")), Cred::default(), None)
            .is_err());
    }
}
