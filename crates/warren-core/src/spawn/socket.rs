//! Stage frames for the spawn protocol.
//!
//! The daemon, the broker and the task talk over a socketpair using three
//! frame kinds: pid reports, wakeups and a final error. Pid reports ride
//! with `SCM_CREDENTIALS`, so the kernel translates the pid into the
//! receiver's pid namespace while the payload keeps the sender's view;
//! the receiver thus learns both sides of the mapping in one message.
//!
//! Both socket ends carry `CLOEXEC`: a successful `execve` closes the
//! task's end, which the daemon observes as a clean end-of-stream in
//! [`SpawnSocket::recv_error`].

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, sockopt, ControlMessage, ControlMessageOwned, MsgFlags,
    UnixCredentials,
};

use crate::error::{Error, ErrorKind, Result};

const TAG_PID: u8 = 1;
const TAG_WAKE: u8 = 2;
const TAG_ERROR: u8 = 3;

/// One end of the spawn stage channel.
#[derive(Debug)]
pub struct SpawnSocket {
    stream: UnixStream,
}

impl SpawnSocket {
    /// Creates a connected pair with credential passing enabled.
    ///
    /// # Errors
    ///
    /// Propagates socket creation failures.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair().map_err(Error::from)?;
        for stream in [&a, &b] {
            setsockopt(stream, sockopt::PassCred, &true).map_err(Error::from)?;
        }
        Ok((Self { stream: a }, Self { stream: b }))
    }

    /// Bounds how long receives may block.
    ///
    /// # Errors
    ///
    /// Propagates the sockopt failure.
    pub fn set_recv_timeout(&self, timeout: Duration) -> Result<()> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(Error::from)
    }

    /// Raw fd, needed to keep the socket across `exec` bookkeeping.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn send(&self, payload: &[u8], cmsgs: &[ControlMessage<'_>]) -> Result<()> {
        let iov = [IoSlice::new(payload)];
        sendmsg::<()>(
            self.stream.as_raw_fd(),
            &iov,
            cmsgs,
            MsgFlags::empty(),
            None,
        )
        .map_err(|e| Error::os("send spawn frame", e))?;
        Ok(())
    }

    /// Receives one frame into `payload`; returns the byte count and the
    /// credential pid, if one rode along.
    fn recv(&self, payload: &mut [u8]) -> Result<(usize, Option<i32>)> {
        let mut cmsg_buffer = nix::cmsg_space!(UnixCredentials);
        let mut iov = [IoSliceMut::new(payload)];
        let msg = recvmsg::<()>(
            self.stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )
        .map_err(|e| Error::os("recv spawn frame", e))?;

        let bytes = msg.bytes;
        let mut cred_pid = None;
        for cmsg in msg
            .cmsgs()
            .map_err(|e| Error::os("parse spawn frame cmsg", e))?
        {
            if let ControlMessageOwned::ScmCredentials(creds) = cmsg {
                cred_pid = Some(creds.pid());
            }
        }
        Ok((bytes, cred_pid))
    }

    /// Reports a pid. `pid` is a pid in the sender's namespace; forging a
    /// pid other than the caller's own needs root, which the spawn path
    /// has.
    ///
    /// # Errors
    ///
    /// Propagates the send failure.
    pub fn send_pid(&self, pid: i32) -> Result<()> {
        let mut payload = [0u8; 5];
        payload[0] = TAG_PID;
        payload[1..5].copy_from_slice(&pid.to_le_bytes());

        let creds: UnixCredentials = libc::ucred {
            pid,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
        .into();
        self.send(&payload, &[ControlMessage::ScmCredentials(&creds)])
    }

    /// Receives a pid report: `(translated, senders_view)`.
    ///
    /// # Errors
    ///
    /// `Unknown` on closed stream or a non-pid frame.
    pub fn recv_pid(&self) -> Result<(i32, i32)> {
        let mut payload = [0u8; 5];
        let (bytes, cred_pid) = self.recv(&mut payload)?;

        if bytes == 0 {
            return Err(Error::new(ErrorKind::Unknown, "spawn socket closed before pid report"));
        }
        if bytes != payload.len() || payload[0] != TAG_PID {
            return Err(Error::new(ErrorKind::Unknown, "unexpected frame instead of pid report"));
        }
        let raw = i32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        Ok((cred_pid.unwrap_or(raw), raw))
    }

    /// Sends a wakeup.
    ///
    /// # Errors
    ///
    /// Propagates the send failure.
    pub fn send_wake(&self) -> Result<()> {
        self.send(&[TAG_WAKE], &[])
    }

    /// Blocks until the peer's wakeup arrives.
    ///
    /// # Errors
    ///
    /// `Unknown` on closed stream or an unexpected frame.
    pub fn recv_wake(&self) -> Result<()> {
        let mut payload = [0u8; 1];
        let (bytes, _) = self.recv(&mut payload)?;
        if bytes == 0 {
            return Err(Error::new(ErrorKind::Unknown, "spawn socket closed before wakeup"));
        }
        if payload[0] != TAG_WAKE {
            return Err(Error::new(ErrorKind::Unknown, "unexpected frame instead of wakeup"));
        }
        Ok(())
    }

    /// Reports a stage failure up the chain.
    ///
    /// # Errors
    ///
    /// Propagates the send failure.
    pub fn send_error(&self, err: &Error) -> Result<()> {
        let message = err.message.as_bytes();
        let mut payload = Vec::with_capacity(13 + message.len());
        payload.push(TAG_ERROR);
        payload.extend_from_slice(&err.kind.code().to_le_bytes());
        payload.extend_from_slice(&err.errno.unwrap_or(0).to_le_bytes());
        payload.extend_from_slice(&(message.len() as u32).to_le_bytes());
        payload.extend_from_slice(message);
        self.send(&payload, &[])
    }

    /// Waits for the final stage outcome.
    ///
    /// A clean end-of-stream means every participant reached `exec` and
    /// the `CLOEXEC` ends died: success, `None`. An error frame carries
    /// the failure.
    ///
    /// # Errors
    ///
    /// `Unknown` for receive failures and malformed frames.
    pub fn recv_error(&self) -> Result<Option<Error>> {
        let mut payload = vec![0u8; 64 * 1024];
        let (bytes, _) = self.recv(&mut payload)?;

        if bytes == 0 {
            return Ok(None);
        }
        if payload[0] != TAG_ERROR || bytes < 13 {
            return Err(Error::new(ErrorKind::Unknown, "unexpected frame instead of error"));
        }
        let kind = i32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let errno = i32::from_le_bytes([payload[5], payload[6], payload[7], payload[8]]);
        let len = u32::from_le_bytes([payload[9], payload[10], payload[11], payload[12]]) as usize;
        let end = (13 + len).min(bytes);
        let message = String::from_utf8_lossy(&payload[13..end]).into_owned();
        Ok(Some(Error {
            kind: ErrorKind::from_code(kind).unwrap_or(ErrorKind::Unknown),
            errno: (errno != 0).then_some(errno),
            message,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_report_round_trip() {
        let (master, sock) = SpawnSocket::pair().unwrap();
        let own = std::process::id() as i32;
        sock.send_pid(own).unwrap();
        let (translated, raw) = master.recv_pid().unwrap();
        assert_eq!(raw, own);
        // Same namespace: the kernel view matches the payload.
        assert_eq!(translated, own);
    }

    #[test]
    fn wake_round_trip() {
        let (master, sock) = SpawnSocket::pair().unwrap();
        master.send_wake().unwrap();
        sock.recv_wake().unwrap();
    }

    #[test]
    fn error_round_trip() {
        let (master, sock) = SpawnSocket::pair().unwrap();
        let sent = Error {
            kind: ErrorKind::InvalidValue,
            errno: Some(libc::ENOENT),
            message: "execvpe(/bin/missing)".to_string(),
        };
        sock.send_error(&sent).unwrap();
        let got = master.recv_error().unwrap().unwrap();
        assert_eq!(got, sent);
    }

    #[test]
    fn closed_peer_reads_as_success() {
        let (master, sock) = SpawnSocket::pair().unwrap();
        drop(sock);
        assert!(master.recv_error().unwrap().is_none());
    }

    #[test]
    fn frame_kinds_are_checked() {
        let (master, sock) = SpawnSocket::pair().unwrap();
        sock.send_wake().unwrap();
        assert!(master.recv_pid().is_err());
    }

    #[test]
    fn recv_timeout_applies() {
        let (master, _sock) = SpawnSocket::pair().unwrap();
        master
            .set_recv_timeout(Duration::from_millis(50))
            .unwrap();
        assert!(master.recv_wake().is_err());
    }
}
