//! Daemon configuration.
//!
//! Loaded once at startup from a JSON file; every field has a default so an
//! absent or empty file yields a usable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Service containers the daemon keeps for itself on top of `max_total`.
pub const NR_SERVICE_CONTAINERS: usize = 4;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Listening socket path.
    pub socket_path: PathBuf,

    /// Directory of per-container key-value state files.
    pub keyvalue_dir: PathBuf,

    /// Scratch directory for container working dirs and stdio files.
    pub tmp_dir: PathBuf,

    /// Directory holding volume storage.
    pub volumes_dir: PathBuf,

    /// Root of the cgroup-v1 hierarchy.
    pub cgroup_root: PathBuf,

    /// Container limits and timings.
    pub container: ContainerConfig,

    /// RPC limits and timings.
    pub daemon: ServiceConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/warren/warrend.sock"),
            keyvalue_dir: PathBuf::from("/var/lib/warren/state"),
            tmp_dir: PathBuf::from("/var/lib/warren/work"),
            volumes_dir: PathBuf::from("/var/lib/warren/volumes"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            container: ContainerConfig::default(),
            daemon: ServiceConfig::default(),
        }
    }
}

/// Limits and timings applied to containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Maximum number of client-visible containers.
    pub max_total: usize,

    /// Maximum length of a full container path.
    pub name_max: usize,

    /// Maximum length of a single path component.
    pub component_max: usize,

    /// Maximum nesting depth.
    pub level_max: usize,

    /// How long a Dead container lingers before the rotation tick destroys
    /// it, unless overridden per container.
    #[serde(with = "humantime_serde")]
    pub default_aging_time: Duration,

    /// Delay between a respawnable death and the restart attempt.
    #[serde(with = "humantime_serde")]
    pub respawn_delay: Duration,

    /// Grace period for SIGTERM during stop before escalation.
    #[serde(with = "humantime_serde")]
    pub kill_timeout: Duration,

    /// Default deadline for a client `Stop` that names none.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// How long the spawn handshake may take before the construction is
    /// torn down.
    #[serde(with = "humantime_serde")]
    pub start_timeout: Duration,

    /// Size cap for container stdout/stderr files before rotation.
    pub stdout_limit: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            max_total: 3000,
            name_max: 200,
            component_max: 128,
            level_max: 7,
            default_aging_time: Duration::from_secs(24 * 60 * 60),
            respawn_delay: Duration::from_secs(1),
            kill_timeout: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(300),
            stdout_limit: 8 * 1024 * 1024,
        }
    }
}

/// RPC service limits and timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Maximum protobuf frame payload size.
    pub max_msg_len: usize,

    /// Number of event-queue worker tasks.
    pub event_workers: usize,

    /// Period of the log-rotation and aging tick.
    #[serde(with = "humantime_serde")]
    pub rotate_interval: Duration,

    /// Requests slower than this are logged.
    #[serde(with = "humantime_serde")]
    pub slow_request: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_msg_len: 32 * 1024 * 1024,
            event_workers: 2,
            rotate_interval: Duration::from_secs(60),
            slow_request: Duration::from_secs(1),
        }
    }
}

impl DaemonConfig {
    /// Loads the configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for unreadable or malformed files.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::new(
                ErrorKind::InvalidValue,
                format!("cannot read config {}: {e}", path.display()),
            )
        })?;
        serde_json::from_str(&text).map_err(|e| {
            Error::new(
                ErrorKind::InvalidValue,
                format!("cannot parse config {}: {e}", path.display()),
            )
        })
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert!(config.container.max_total > 0);
        assert!(config.container.level_max >= 2);
        assert!(config.daemon.max_msg_len >= 1024);
        assert!(config.daemon.event_workers >= 1);
    }

    #[test]
    fn loads_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"container": {{"max_total": 10, "respawn_delay": "250ms"}}}}"#
        )
        .unwrap();
        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.container.max_total, 10);
        assert_eq!(config.container.respawn_delay, Duration::from_millis(250));
        // Untouched fields keep defaults.
        assert_eq!(config.container.level_max, 7);
    }

    #[test]
    fn rejects_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(DaemonConfig::load(file.path()).is_err());
    }
}
