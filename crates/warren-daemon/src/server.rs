//! The listening socket and accept loop.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use tokio::net::UnixListener;
use tracing::{info, warn};
use warren_core::error::{Error, Result};
use warren_core::Engine;

use crate::client::ClientSession;

/// Binds the control socket, replacing a stale one.
///
/// # Errors
///
/// Propagates bind and permission failures.
pub fn bind(engine: &Arc<Engine>) -> Result<UnixListener> {
    let path = &engine.config.socket_path;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::from(e).context(format!("mkdir {}", dir.display())))?;
    }
    if path.exists() {
        std::fs::remove_file(path)
            .map_err(|e| Error::from(e).context("remove stale socket"))?;
    }
    let listener = UnixListener::bind(path)
        .map_err(|e| Error::from(e).context(format!("bind {}", path.display())))?;
    // Everybody may connect; per-request permissions do the real work.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
        .map_err(|e| Error::from(e).context("chmod socket"))?;
    info!(path = %path.display(), "listening");
    Ok(listener)
}

/// Accepts connections forever, one task per client.
pub async fn serve(engine: Arc<Engine>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => match ClientSession::accept(engine.clone(), stream) {
                Ok(session) => {
                    tokio::spawn(session.run());
                }
                Err(err) => {
                    warn!(%err, "rejecting client");
                }
            },
            Err(err) => {
                warn!(%err, "accept failed");
            }
        }
    }
}
