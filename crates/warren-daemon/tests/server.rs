//! Control-socket plumbing that works without privileges.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use warren_core::{DaemonConfig, Engine};

fn engine(dir: &std::path::Path) -> Arc<Engine> {
    let config = DaemonConfig {
        socket_path: dir.join("warrend.sock"),
        keyvalue_dir: dir.join("state"),
        tmp_dir: dir.join("work"),
        volumes_dir: dir.join("volumes"),
        cgroup_root: dir.join("cgroup"),
        ..DaemonConfig::default()
    };
    Engine::new(config).expect("build engine")
}

#[tokio::test]
async fn bind_creates_world_writable_socket() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());

    let _listener = warren_daemon::server::bind(&engine).unwrap();

    let meta = std::fs::metadata(&engine.config.socket_path).unwrap();
    assert_eq!(meta.permissions().mode() & 0o777, 0o666);
}

#[tokio::test]
async fn bind_replaces_stale_socket() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());

    let first = warren_daemon::server::bind(&engine).unwrap();
    drop(first);
    // The stale socket file is still there; a rebind must win.
    assert!(engine.config.socket_path.exists());
    let _second = warren_daemon::server::bind(&engine).unwrap();

    let stream = tokio::net::UnixStream::connect(&engine.config.socket_path).await;
    assert!(stream.is_ok());
}
