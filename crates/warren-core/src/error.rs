//! The tagged error type shared by the engine and the RPC surface.
//!
//! Every fallible operation returns an [`Error`] carrying an [`ErrorKind`]
//! (which doubles as the wire status code), the originating errno when the
//! failure came from a syscall, and a free-text message. Errors are values;
//! they are propagated with `?` until a boundary logs them, aborts the
//! in-flight request, or signals the spawn socket.

use std::io;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes shared between internal errors and RPC responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorKind {
    /// Unclassified failure, usually a syscall error with an errno.
    Unknown = 1,
    /// A supplied value failed validation.
    InvalidValue = 2,
    /// The operation is not legal in the container's current state.
    InvalidState = 3,
    /// The property name is not known.
    InvalidProperty = 4,
    /// A container with this name already exists.
    ContainerAlreadyExists = 5,
    /// No container with this name.
    ContainerDoesNotExist = 6,
    /// The caller is not allowed to do this.
    Permission = 7,
    /// The feature is not available on this host or configuration.
    NotSupported = 8,
    /// A bounded resource (container slots, ids) is exhausted.
    ResourceNotAvailable = 9,
    /// Out of disk space.
    NoSpace = 10,
    /// A lock could not be taken without blocking.
    Busy = 11,
    /// Not an error: the frame is incomplete, keep reading. Never sent
    /// to a client.
    Queued = 12,
}

impl ErrorKind {
    /// Wire representation of the status code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Decodes a wire status code.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Unknown),
            2 => Some(Self::InvalidValue),
            3 => Some(Self::InvalidState),
            4 => Some(Self::InvalidProperty),
            5 => Some(Self::ContainerAlreadyExists),
            6 => Some(Self::ContainerDoesNotExist),
            7 => Some(Self::Permission),
            8 => Some(Self::NotSupported),
            9 => Some(Self::ResourceNotAvailable),
            10 => Some(Self::NoSpace),
            11 => Some(Self::Busy),
            12 => Some(Self::Queued),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::InvalidValue => "InvalidValue",
            Self::InvalidState => "InvalidState",
            Self::InvalidProperty => "InvalidProperty",
            Self::ContainerAlreadyExists => "ContainerAlreadyExists",
            Self::ContainerDoesNotExist => "ContainerDoesNotExist",
            Self::Permission => "Permission",
            Self::NotSupported => "NotSupported",
            Self::ResourceNotAvailable => "ResourceNotAvailable",
            Self::NoSpace => "NoSpace",
            Self::Busy => "Busy",
            Self::Queued => "Queued",
        };
        f.write_str(name)
    }
}

/// A tagged engine error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    /// Classification, also the RPC status code.
    pub kind: ErrorKind,
    /// System errno when the failure came from a syscall.
    pub errno: Option<i32>,
    /// Human-readable context.
    pub message: String,
}

impl Error {
    /// Creates an error without an errno.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            errno: None,
            message: message.into(),
        }
    }

    /// Creates an error that originated in a syscall.
    pub fn errno(kind: ErrorKind, errno: nix::errno::Errno, message: impl Into<String>) -> Self {
        Self {
            kind,
            errno: Some(errno as i32),
            message: format!("{}: {errno}", message.into()),
        }
    }

    /// Wraps a syscall failure as `Unknown` keeping the errno.
    pub fn os(message: impl Into<String>, errno: nix::errno::Errno) -> Self {
        Self::errno(ErrorKind::Unknown, errno, message)
    }

    /// Adds leading context to the message, keeping kind and errno.
    #[must_use]
    pub fn context(mut self, ctx: impl AsRef<str>) -> Self {
        self.message = format!("{}: {}", ctx.as_ref(), self.message);
        self
    }

    /// True for the internal keep-reading marker.
    #[must_use]
    pub const fn is_queued(&self) -> bool {
        matches!(self.kind, ErrorKind::Queued)
    }

    /// Raw errno value, if any.
    #[must_use]
    pub fn raw_errno(&self) -> Option<i32> {
        self.errno
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.raw_os_error() {
            Some(code) if code == libc::ENOSPC => ErrorKind::NoSpace,
            Some(code) if code == libc::EACCES || code == libc::EPERM => ErrorKind::Permission,
            _ => ErrorKind::Unknown,
        };
        Self {
            kind,
            errno: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Self {
            kind: match errno {
                nix::errno::Errno::ENOSPC => ErrorKind::NoSpace,
                nix::errno::Errno::EACCES | nix::errno::Errno::EPERM => ErrorKind::Permission,
                _ => ErrorKind::Unknown,
            },
            errno: Some(errno as i32),
            message: errno.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_round_trip() {
        for kind in [
            ErrorKind::Unknown,
            ErrorKind::InvalidValue,
            ErrorKind::InvalidState,
            ErrorKind::InvalidProperty,
            ErrorKind::ContainerAlreadyExists,
            ErrorKind::ContainerDoesNotExist,
            ErrorKind::Permission,
            ErrorKind::NotSupported,
            ErrorKind::ResourceNotAvailable,
            ErrorKind::NoSpace,
            ErrorKind::Busy,
            ErrorKind::Queued,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code(0), None);
        assert_eq!(ErrorKind::from_code(999), None);
    }

    #[test]
    fn errno_is_preserved() {
        let err = Error::errno(
            ErrorKind::Unknown,
            nix::errno::Errno::EBUSY,
            "memory.limit_in_bytes",
        );
        assert_eq!(err.raw_errno(), Some(libc::EBUSY));
        assert!(err.message.contains("memory.limit_in_bytes"));
    }

    #[test]
    fn io_error_maps_nospace() {
        let io = io::Error::from_raw_os_error(libc::ENOSPC);
        let err = Error::from(io);
        assert_eq!(err.kind, ErrorKind::NoSpace);
        assert_eq!(err.raw_errno(), Some(libc::ENOSPC));
    }

    #[test]
    fn context_prepends() {
        let err = Error::new(ErrorKind::InvalidValue, "bad name").context("create");
        assert_eq!(err.message, "create: bad name");
        assert_eq!(err.kind, ErrorKind::InvalidValue);
    }
}
