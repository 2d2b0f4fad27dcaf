//! On-disk container state.
//!
//! One JSON file per container id holds every property the owner
//! explicitly set, plus the reserved keys `id`, `name` and `state`.
//! Startup replays the directory in parent-before-child order; destroy
//! removes the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use tracing::warn;

use crate::error::{Error, ErrorKind, Result};

/// Reserved key: dense container id.
pub const KEY_ID: &str = "id";
/// Reserved key: absolute container name.
pub const KEY_NAME: &str = "name";
/// Reserved key: lifecycle state at save time.
pub const KEY_STATE: &str = "state";

/// A saved property snapshot.
pub type KvRecord = BTreeMap<String, String>;

/// Directory-backed key-value store, one file per container id.
#[derive(Debug, Clone)]
pub struct KvStore {
    dir: PathBuf,
}

impl KvStore {
    /// Opens (and creates) the store directory.
    ///
    /// # Errors
    ///
    /// Propagates directory creation failures.
    pub fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .map_err(|e| Error::from(e).context(format!("mkdir {}", dir.display())))?;
        Ok(Self { dir })
    }

    fn node_path(&self, id: u32) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Writes a record, replacing any previous snapshot atomically.
    ///
    /// # Errors
    ///
    /// Propagates serialization and filesystem failures.
    pub fn save(&self, id: u32, record: &KvRecord) -> Result<()> {
        let text = serde_json::to_string_pretty(record)
            .map_err(|e| Error::new(ErrorKind::Unknown, format!("serialize state: {e}")))?;
        let tmp = self.dir.join(format!(".{id}.tmp"));
        fs::write(&tmp, text).map_err(Error::from)?;
        fs::rename(&tmp, self.node_path(id)).map_err(Error::from)?;
        Ok(())
    }

    /// Reads one record.
    ///
    /// # Errors
    ///
    /// `ContainerDoesNotExist` for a missing file, `Unknown` for malformed
    /// content.
    pub fn load(&self, id: u32) -> Result<KvRecord> {
        let path = self.node_path(id);
        let text = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::new(ErrorKind::ContainerDoesNotExist, format!("no state file for id {id}"))
            } else {
                Error::from(e)
            }
        })?;
        serde_json::from_str(&text).map_err(|e| {
            Error::new(
                ErrorKind::Unknown,
                format!("malformed state file {}: {e}", path.display()),
            )
        })
    }

    /// Deletes a record; missing files are fine.
    pub fn remove(&self, id: u32) {
        if let Err(err) = fs::remove_file(self.node_path(id)) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(id, %err, "cannot remove state file");
            }
        }
    }

    /// Loads every record, ordered parent-before-child.
    ///
    /// Unreadable and malformed files are skipped with a warning so one
    /// damaged node cannot block startup.
    ///
    /// # Errors
    ///
    /// Fails only when the directory itself cannot be read.
    pub fn load_all(&self) -> Result<Vec<(u32, KvRecord)>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(Error::from)? {
            let entry = entry.map_err(Error::from)?;
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            match self.load(id) {
                Ok(record) => records.push((id, record)),
                Err(err) => warn!(id, %err, "skipping unreadable state file"),
            }
        }
        // Parents have strictly fewer name components than their children.
        records.sort_by_key(|(_, record)| {
            let name = record.get(KEY_NAME).cloned().unwrap_or_default();
            (name.split('/').count(), name)
        });
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (KvStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (KvStore::open(dir.path().to_path_buf()).unwrap(), dir)
    }

    fn record(name: &str, id: u32) -> KvRecord {
        let mut map = KvRecord::new();
        map.insert(KEY_ID.to_string(), id.to_string());
        map.insert(KEY_NAME.to_string(), name.to_string());
        map.insert(KEY_STATE.to_string(), "stopped".to_string());
        map
    }

    #[test]
    fn save_load_round_trip() {
        let (store, _dir) = store();
        let mut rec = record("a", 3);
        rec.insert("command".to_string(), "/bin/true".to_string());
        store.save(3, &rec).unwrap();
        assert_eq!(store.load(3).unwrap(), rec);
    }

    #[test]
    fn load_missing_fails() {
        let (store, _dir) = store();
        assert_eq!(
            store.load(9).unwrap_err().kind,
            ErrorKind::ContainerDoesNotExist
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let (store, _dir) = store();
        store.save(1, &record("a", 1)).unwrap();
        store.remove(1);
        store.remove(1);
        assert!(store.load(1).is_err());
    }

    #[test]
    fn load_all_orders_parents_first() {
        let (store, _dir) = store();
        store.save(3, &record("a/b/c", 3)).unwrap();
        store.save(1, &record("a", 1)).unwrap();
        store.save(2, &record("a/b", 2)).unwrap();
        store.save(4, &record("b", 4)).unwrap();

        let names: Vec<_> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|(_, r)| r[KEY_NAME].clone())
            .collect();
        assert_eq!(names, ["a", "b", "a/b", "a/b/c"]);
    }

    #[test]
    fn malformed_files_are_skipped() {
        let (store, dir) = store();
        store.save(1, &record("a", 1)).unwrap();
        fs::write(dir.path().join("2"), "not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, 1);
    }
}
