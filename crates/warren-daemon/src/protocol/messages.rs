//! Protobuf schema of the control protocol.
//!
//! One `ContainerRequest` per frame, exactly one sub-request set; the
//! reply is a `ContainerResponse` with the shared status code, a message
//! and the operation's payload. Messages are declared inline with
//! explicit field tags, which keeps the schema next to the dispatcher
//! and needs no build step.

use prost::Message;
use warren_core::error::{Error, ErrorKind};

/// A client request envelope.
#[derive(Clone, PartialEq, Message)]
pub struct ContainerRequest {
    /// Create a container.
    #[prost(message, optional, tag = "1")]
    pub create: Option<CreateRequest>,
    /// Destroy a container and its subtree.
    #[prost(message, optional, tag = "2")]
    pub destroy: Option<DestroyRequest>,
    /// List visible containers.
    #[prost(message, optional, tag = "3")]
    pub list: Option<ListRequest>,
    /// Start a container.
    #[prost(message, optional, tag = "4")]
    pub start: Option<StartRequest>,
    /// Stop a container.
    #[prost(message, optional, tag = "5")]
    pub stop: Option<StopRequest>,
    /// Freeze a subtree.
    #[prost(message, optional, tag = "6")]
    pub pause: Option<PauseRequest>,
    /// Thaw a subtree.
    #[prost(message, optional, tag = "7")]
    pub resume: Option<ResumeRequest>,
    /// Signal the main task.
    #[prost(message, optional, tag = "8")]
    pub kill: Option<KillRequest>,
    /// Read a property.
    #[prost(message, optional, tag = "9")]
    pub get_property: Option<GetPropertyRequest>,
    /// Write a property.
    #[prost(message, optional, tag = "10")]
    pub set_property: Option<SetPropertyRequest>,
    /// Park until a container reaches a terminal state.
    #[prost(message, optional, tag = "11")]
    pub wait: Option<WaitRequest>,
    /// Read a runtime datum; same table as `get_property`.
    #[prost(message, optional, tag = "12")]
    pub get_data: Option<GetPropertyRequest>,
    /// Create a volume.
    #[prost(message, optional, tag = "13")]
    pub create_volume: Option<CreateVolumeRequest>,
    /// Link a volume to a container.
    #[prost(message, optional, tag = "14")]
    pub link_volume: Option<LinkVolumeRequest>,
    /// Unlink a volume from a container.
    #[prost(message, optional, tag = "15")]
    pub unlink_volume: Option<LinkVolumeRequest>,
}

/// Create a container.
#[derive(Clone, PartialEq, Message)]
pub struct CreateRequest {
    /// Namespace-relative name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Tie the container's lifetime to this connection.
    #[prost(bool, optional, tag = "2")]
    pub weak: Option<bool>,
}

/// Destroy a container.
#[derive(Clone, PartialEq, Message)]
pub struct DestroyRequest {
    /// Namespace-relative name.
    #[prost(string, tag = "1")]
    pub name: String,
}

/// List containers visible in the client's namespace.
#[derive(Clone, PartialEq, Message)]
pub struct ListRequest {
    /// Optional wildcard filter on relative names.
    #[prost(string, optional, tag = "1")]
    pub mask: Option<String>,
}

/// Start a container.
#[derive(Clone, PartialEq, Message)]
pub struct StartRequest {
    /// Namespace-relative name.
    #[prost(string, tag = "1")]
    pub name: String,
}

/// Stop a container.
#[derive(Clone, PartialEq, Message)]
pub struct StopRequest {
    /// Namespace-relative name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// SIGTERM grace period before escalation; daemon default if unset.
    #[prost(uint64, optional, tag = "2")]
    pub timeout_ms: Option<u64>,
}

/// Pause a subtree.
#[derive(Clone, PartialEq, Message)]
pub struct PauseRequest {
    /// Namespace-relative name.
    #[prost(string, tag = "1")]
    pub name: String,
}

/// Resume a subtree.
#[derive(Clone, PartialEq, Message)]
pub struct ResumeRequest {
    /// Namespace-relative name.
    #[prost(string, tag = "1")]
    pub name: String,
}

/// Signal the main task of a running container.
#[derive(Clone, PartialEq, Message)]
pub struct KillRequest {
    /// Namespace-relative name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Signal number.
    #[prost(int32, tag = "2")]
    pub sig: i32,
}

/// Read one property.
#[derive(Clone, PartialEq, Message)]
pub struct GetPropertyRequest {
    /// Namespace-relative name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Property name; dotted names read cgroup knobs.
    #[prost(string, tag = "2")]
    pub property: String,
}

/// Write one property.
#[derive(Clone, PartialEq, Message)]
pub struct SetPropertyRequest {
    /// Namespace-relative name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Property name.
    #[prost(string, tag = "2")]
    pub property: String,
    /// New value in the property's text syntax.
    #[prost(string, tag = "3")]
    pub value: String,
}

/// Park the connection until a named container (or a wildcard match)
/// reaches a terminal state.
#[derive(Clone, PartialEq, Message)]
pub struct WaitRequest {
    /// Names to wait for; entries with `*` or `?` are patterns.
    #[prost(string, repeated, tag = "1")]
    pub name: Vec<String>,
    /// Give up after this long; forever if unset.
    #[prost(uint64, optional, tag = "2")]
    pub timeout_ms: Option<u64>,
}

/// Create a volume.
#[derive(Clone, PartialEq, Message)]
pub struct CreateVolumeRequest {
    /// Absolute path; the daemon picks one if unset.
    #[prost(string, optional, tag = "1")]
    pub path: Option<String>,
    /// Container to link; the caller's own container if unset.
    #[prost(string, optional, tag = "2")]
    pub container: Option<String>,
}

/// Link or unlink a volume and a container.
#[derive(Clone, PartialEq, Message)]
pub struct LinkVolumeRequest {
    /// Volume path.
    #[prost(string, tag = "1")]
    pub path: String,
    /// Container to (un)link; the caller's own container if unset.
    #[prost(string, optional, tag = "2")]
    pub container: Option<String>,
}

/// The reply envelope.
#[derive(Clone, PartialEq, Message)]
pub struct ContainerResponse {
    /// Shared status code; 0 is success.
    #[prost(int32, tag = "1")]
    pub error: i32,
    /// Free-text failure context.
    #[prost(string, tag = "2")]
    pub error_msg: String,
    /// List payload.
    #[prost(message, optional, tag = "3")]
    pub list: Option<ListResponse>,
    /// Property payload.
    #[prost(message, optional, tag = "4")]
    pub value: Option<ValueResponse>,
    /// Wait payload.
    #[prost(message, optional, tag = "5")]
    pub wait: Option<WaitResponse>,
    /// Volume payload.
    #[prost(message, optional, tag = "6")]
    pub volume: Option<VolumeResponse>,
}

/// Container names visible to the caller.
#[derive(Clone, PartialEq, Message)]
pub struct ListResponse {
    /// Relative names, sorted.
    #[prost(string, repeated, tag = "1")]
    pub name: Vec<String>,
}

/// One property value.
#[derive(Clone, PartialEq, Message)]
pub struct ValueResponse {
    /// The value in the property's text syntax.
    #[prost(string, tag = "1")]
    pub value: String,
}

/// The container that woke a wait.
#[derive(Clone, PartialEq, Message)]
pub struct WaitResponse {
    /// Relative name; empty when the wait timed out.
    #[prost(string, tag = "1")]
    pub name: String,
}

/// The volume an operation produced or touched.
#[derive(Clone, PartialEq, Message)]
pub struct VolumeResponse {
    /// Absolute volume path.
    #[prost(string, tag = "1")]
    pub path: String,
}

impl ContainerResponse {
    /// A bare success reply.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// A failure reply carrying the error's code and message.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        Self {
            error: err.kind.code(),
            error_msg: err.message.clone(),
            ..Self::default()
        }
    }
}

/// Decodes a request frame.
///
/// # Errors
///
/// `InvalidValue` for undecodable payloads.
pub fn decode_request(frame: &[u8]) -> Result<ContainerRequest, Error> {
    ContainerRequest::decode(frame)
        .map_err(|e| Error::new(ErrorKind::InvalidValue, format!("cannot parse request: {e}")))
}

/// Encodes a response frame.
#[must_use]
pub fn encode_response(response: &ContainerResponse) -> bytes::Bytes {
    bytes::Bytes::from(response.encode_to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let request = ContainerRequest {
            create: Some(CreateRequest {
                name: "a/b".to_string(),
                weak: Some(true),
            }),
            ..Default::default()
        };
        let bytes = request.encode_to_vec();
        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn response_round_trip() {
        let response = ContainerResponse {
            error: 0,
            list: Some(ListResponse {
                name: vec!["a".to_string(), "a/b".to_string()],
            }),
            ..Default::default()
        };
        let bytes = encode_response(&response);
        let decoded = ContainerResponse::decode(&bytes[..]).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn error_response_carries_code() {
        let err = Error::new(ErrorKind::Permission, "no");
        let response = ContainerResponse::from_error(&err);
        assert_eq!(response.error, ErrorKind::Permission.code());
        assert_eq!(response.error_msg, "no");
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(decode_request(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn empty_request_decodes_to_no_op() {
        let decoded = decode_request(&[]).unwrap();
        assert_eq!(decoded, ContainerRequest::default());
    }
}
