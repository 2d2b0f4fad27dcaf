//! The unix-socket control protocol: framing, message schema and the
//! request dispatcher.

pub mod dispatch;
pub mod framing;
pub mod messages;

pub use framing::FrameCodec;
pub use messages::{ContainerRequest, ContainerResponse};
