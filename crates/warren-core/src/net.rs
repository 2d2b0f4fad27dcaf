//! Network configuration surface of the engine.
//!
//! Traffic shaping itself lives outside the engine; this module keeps the
//! per-container pieces the core needs: parsing the `net` property,
//! computing the traffic-class handle derived from the container id, and
//! the per-interface rate maps stored on the record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Major number of the root qdisc handle all container classes hang off.
pub const ROOT_TC_MAJOR: u32 = 1;
/// Minor used when no container on the chain owns a net_cls controller.
pub const DEFAULT_TC_MINOR: u32 = 2;
/// Default priority for the `default` interface entry.
pub const DEFAULT_NET_PRIO: u64 = 3;

/// How a container gets its network namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetMode {
    /// Share the parent's namespace.
    #[default]
    Inherited,
    /// Fresh namespace with only loopback.
    None,
    /// Stay in the host namespace.
    Host,
}

impl NetMode {
    /// Parses the first token of the `net` property.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for unknown modes and `NotSupported` for
    /// modes the engine knows about but does not implement.
    pub fn parse(text: &str) -> Result<Self> {
        match text.trim() {
            "" | "inherited" => Ok(Self::Inherited),
            "none" => Ok(Self::None),
            "host" => Ok(Self::Host),
            "macvlan" | "ipvlan" | "veth" | "L3" | "NAT" => Err(Error::new(
                ErrorKind::NotSupported,
                format!("net mode '{text}' is not supported by this build"),
            )),
            other => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown net mode '{other}'"),
            )),
        }
    }
}

impl std::fmt::Display for NetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Inherited => "inherited",
            Self::None => "none",
            Self::Host => "host",
        };
        f.write_str(name)
    }
}

/// Per-container network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Namespace mode.
    pub mode: NetMode,
    /// Priority per interface name, `default` applies to the rest.
    pub priority: HashMap<String, u64>,
    /// Guaranteed rate per interface, bytes per second.
    pub guarantee: HashMap<String, u64>,
    /// Rate ceiling per interface, bytes per second.
    pub limit: HashMap<String, u64>,
}

impl Default for NetConfig {
    fn default() -> Self {
        let mut priority = HashMap::new();
        priority.insert("default".to_string(), DEFAULT_NET_PRIO);
        Self {
            mode: NetMode::Inherited,
            priority,
            guarantee: HashMap::new(),
            limit: HashMap::new(),
        }
    }
}

/// Builds a `major:minor` traffic-class handle.
#[must_use]
pub const fn tc_handle(major: u32, minor: u32) -> u32 {
    (major << 16) | (minor & 0xffff)
}

/// Parses an `iface: value` map property like `net_priority`.
///
/// Entries are `;` separated, `default` names the fallback.
///
/// # Errors
///
/// Returns `InvalidValue` for malformed entries.
pub fn parse_rate_map(text: &str) -> Result<HashMap<String, u64>> {
    let mut map = HashMap::new();
    for entry in text.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (iface, value) = entry.split_once(':').ok_or_else(|| {
            Error::new(ErrorKind::InvalidValue, format!("expected 'iface: value' in '{entry}'"))
        })?;
        let value: u64 = value.trim().parse().map_err(|_| {
            Error::new(ErrorKind::InvalidValue, format!("bad number in '{entry}'"))
        })?;
        map.insert(iface.trim().to_string(), value);
    }
    Ok(map)
}

/// Formats a rate map back into the property syntax, sorted for stability.
#[must_use]
pub fn format_rate_map(map: &HashMap<String, u64>) -> String {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .map(|(iface, value)| format!("{iface}: {value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_modes() {
        assert_eq!(NetMode::parse("inherited").unwrap(), NetMode::Inherited);
        assert_eq!(NetMode::parse("").unwrap(), NetMode::Inherited);
        assert_eq!(NetMode::parse("none").unwrap(), NetMode::None);
        assert_eq!(NetMode::parse("host").unwrap(), NetMode::Host);
        assert_eq!(
            NetMode::parse("macvlan").unwrap_err().kind,
            ErrorKind::NotSupported
        );
        assert_eq!(
            NetMode::parse("bogus").unwrap_err().kind,
            ErrorKind::InvalidValue
        );
    }

    #[test]
    fn tc_handles() {
        assert_eq!(tc_handle(1, 5), 0x0001_0005);
        assert_eq!(tc_handle(ROOT_TC_MAJOR, DEFAULT_TC_MINOR), 0x0001_0002);
    }

    #[test]
    fn rate_map_round_trip() {
        let map = parse_rate_map("eth0: 100; default: 3").unwrap();
        assert_eq!(map["eth0"], 100);
        assert_eq!(map["default"], 3);
        assert_eq!(format_rate_map(&map), "default: 3; eth0: 100");
        assert!(parse_rate_map("eth0").is_err());
        assert!(parse_rate_map("eth0: many").is_err());
    }
}
