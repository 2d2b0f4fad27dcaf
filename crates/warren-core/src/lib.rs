//! # warren-core
//!
//! Container lifecycle engine for the warren daemon: the hierarchical
//! container registry and its locking discipline, the per-container
//! state machine, the staged spawn protocol, the delayed-event queue,
//! waiters and the persistence layer.
//!
//! The crate exposes one composition root, [`engine::Engine`]; the
//! daemon crate adds the RPC surface and client identification on top.
//!
//! ## Example
//!
//! ```rust,no_run
//! use warren_core::config::DaemonConfig;
//! use warren_core::cred::Cred;
//! use warren_core::engine::Engine;
//!
//! let engine = Engine::new(DaemonConfig::default())?;
//! let ct = engine.create_container("worker", Cred::new(0, 0), |_| Ok(()))?;
//! # Ok::<(), warren_core::error::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod caps;
pub mod cgroup;
pub mod config;
pub mod container;
pub mod cred;
pub mod engine;
pub mod error;
pub mod events;
pub mod idmap;
mod lifecycle;
pub mod name;
pub mod net;
pub mod persist;
pub mod props;
pub mod registry;
pub mod spawn;
pub mod state;
pub mod volume;
pub mod waiter;

pub use config::DaemonConfig;
pub use container::Container;
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
pub use state::ContainerState;
