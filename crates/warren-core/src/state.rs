//! Container state machine vocabulary.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Lifecycle state of a container.
///
/// Containers are created Stopped and end Destroyed. Meta containers (no
/// command) never enter Dead: when their last running descendant exits they
/// fall back to Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// No kernel resources held.
    Stopped,
    /// Main task is alive.
    Running,
    /// Grouping container without a command; counts running descendants.
    Meta,
    /// Freezer cgroup frozen, subtree included.
    Paused,
    /// Main task exited; exit status and death time recorded.
    Dead,
    /// Unlinked from the registry; terminal.
    Destroyed,
}

impl ContainerState {
    /// True for states in which the container contributes to ancestors'
    /// running-descendant counters.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Running | Self::Meta)
    }

    /// Parses the lowercase state name used on the wire and on disk.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for unknown names.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "stopped" => Ok(Self::Stopped),
            "running" => Ok(Self::Running),
            "meta" => Ok(Self::Meta),
            "paused" => Ok(Self::Paused),
            "dead" => Ok(Self::Dead),
            "destroyed" => Ok(Self::Destroyed),
            _ => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown container state '{name}'"),
            )),
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Meta => "meta",
            Self::Paused => "paused",
            Self::Dead => "dead",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for state in [
            ContainerState::Stopped,
            ContainerState::Running,
            ContainerState::Meta,
            ContainerState::Paused,
            ContainerState::Dead,
            ContainerState::Destroyed,
        ] {
            assert_eq!(ContainerState::parse(&state.to_string()).unwrap(), state);
        }
        assert!(ContainerState::parse("zombie").is_err());
    }

    #[test]
    fn alive_states() {
        assert!(ContainerState::Running.is_alive());
        assert!(ContainerState::Meta.is_alive());
        assert!(!ContainerState::Paused.is_alive());
        assert!(!ContainerState::Dead.is_alive());
    }
}
