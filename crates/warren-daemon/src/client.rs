//! Per-connection client sessions.
//!
//! A session owns the framed socket, the identity derived from the peer
//! credentials, the one container lock a request may hold, and the weak
//! containers whose lifetime is tied to this connection. One request is
//! in flight at a time: the pump does not read ahead of the response.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use warren_core::container::Container;
use warren_core::cred::AccessLevel;
use warren_core::error::{Error, ErrorKind, Result};
use warren_core::events::Event;
use warren_core::registry::ContainerLock;
use warren_core::Engine;

use crate::identity::{ClientIdentity, PeerCred};
use crate::protocol::dispatch;
use crate::protocol::framing::FrameCodec;
use crate::protocol::messages::{decode_request, encode_response, ContainerResponse};

/// One connected client.
pub struct ClientSession {
    engine: Arc<Engine>,
    framed: Framed<UnixStream, FrameCodec>,
    identity: ClientIdentity,
    locked: Option<ContainerLock>,
    weak_containers: Vec<Weak<Container>>,
    connected_at: Instant,
}

impl ClientSession {
    /// Accepts a connection: reads the peer credentials and derives the
    /// initial identity.
    ///
    /// # Errors
    ///
    /// Identification failures; the caller drops the connection.
    pub fn accept(engine: Arc<Engine>, stream: UnixStream) -> Result<Self> {
        let peer = PeerCred::from_stream(&stream)?;
        let identity = ClientIdentity::identify(&engine, peer)?;
        debug!(
            comm = %identity.comm,
            pid = ?peer.pid,
            uid = peer.uid,
            container = %identity.container.name,
            level = %identity.access_level,
            "client connected"
        );
        let codec = FrameCodec::new(engine.config.daemon.max_msg_len);
        Ok(Self {
            engine,
            framed: Framed::new(stream, codec),
            identity,
            locked: None,
            weak_containers: Vec::new(),
            connected_at: Instant::now(),
        })
    }

    /// The engine this session serves.
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The current identity.
    #[must_use]
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Remembers a weak container created over this connection.
    pub fn track_weak(&mut self, ct: &Arc<Container>) {
        self.weak_containers.push(Arc::downgrade(ct));
    }

    /// Resolves, checks read access and read-locks a container, stashing
    /// the lock for release at request completion.
    ///
    /// # Errors
    ///
    /// Name resolution, lookup and lock failures.
    pub async fn read_container(&mut self, relative: &str) -> Result<Arc<Container>> {
        let name = self.identity.resolve(relative)?;
        let ct = self.engine.registry.resolve(&name)?;
        self.release_container();
        let guard = self.engine.registry.lock_read(&ct).await?;
        self.locked = Some(guard);
        Ok(ct)
    }

    /// Resolves, checks write access and write-locks a container.
    ///
    /// # Errors
    ///
    /// `Permission` for read-only identities and foreign owners, plus
    /// resolution and lock failures.
    pub async fn write_container(&mut self, relative: &str) -> Result<Arc<Container>> {
        if self.identity.access_level <= AccessLevel::ReadOnly {
            return Err(Error::new(ErrorKind::Permission, "no write access at all"));
        }
        let name = self.identity.resolve(relative)?;
        let ct = self.engine.registry.resolve(&name)?;
        self.identity.can_control(&ct, false)?;
        self.release_container();
        let guard = self.engine.registry.lock_write(&ct).await?;
        self.locked = Some(guard);
        Ok(ct)
    }

    /// Drops the held container lock, if any.
    pub fn release_container(&mut self) {
        if let Some(lock) = self.locked.take() {
            drop(lock);
        }
    }

    /// Serves the connection until the peer hangs up.
    pub async fn run(mut self) {
        loop {
            let frame = match self.framed.next().await {
                None => break,
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    warn!(comm = %self.identity.comm, %err, "closing connection");
                    let response = ContainerResponse::from_error(&err);
                    let _ = self.framed.send(encode_response(&response)).await;
                    break;
                }
            };

            // Identify on each request: a descriptor passed across a
            // container boundary must not keep the old identity.
            if let Err(err) = self.reidentify() {
                let _ = self
                    .framed
                    .send(encode_response(&ContainerResponse::from_error(&err)))
                    .await;
                break;
            }

            let response = match decode_request(&frame) {
                Ok(request) => {
                    let started = Instant::now();
                    let response = dispatch::handle(&mut self, request).await;
                    self.release_container();
                    let elapsed = started.elapsed();
                    if elapsed > self.engine.config.daemon.slow_request {
                        info!(
                            comm = %self.identity.comm,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "slow request"
                        );
                    }
                    response
                }
                Err(err) => ContainerResponse::from_error(&err),
            };

            if let Err(err) = self.framed.send(encode_response(&response)).await {
                debug!(comm = %self.identity.comm, %err, "cannot send response");
                break;
            }
        }
        self.disconnect();
    }

    fn reidentify(&mut self) -> Result<()> {
        let peer = PeerCred::from_stream(self.framed.get_ref())?;
        if self.identity.still_valid(&peer) {
            return Ok(());
        }
        self.identity = ClientIdentity::identify(&self.engine, peer)?;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.release_container();
        debug!(
            comm = %self.identity.comm,
            connected_ms = self.connected_at.elapsed().as_millis() as u64,
            "client disconnected"
        );
        for weak in self.weak_containers.drain(..) {
            if let Some(ct) = weak.upgrade() {
                if ct.lock_inner().is_weak {
                    self.engine
                        .events
                        .schedule(Duration::ZERO, Event::DestroyWeak { ct: Arc::downgrade(&ct) });
                }
            }
        }
    }
}
