//! Engine-level behaviour crossing module boundaries: lifecycle
//! bookkeeping, waiters, events and persistence working together.

use std::sync::Arc;
use std::time::Duration;

use warren_core::container::wall_ms;
use warren_core::cred::Cred;
use warren_core::events::Event;
use warren_core::waiter::Waiter;
use warren_core::{ContainerState, DaemonConfig, Engine};

fn engine() -> Arc<Engine> {
    let dir = tempfile::tempdir().expect("create test dir").keep();
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

#[test]
fn stop_is_idempotent_on_stopped() {
    let engine = engine();
    let ct = engine
        .create_container("a", Cred::new(0, 0), |_| Ok(()))
        .unwrap();
    assert_eq!(ct.state(), ContainerState::Stopped);
    ct.stop(&engine, Duration::from_millis(100)).unwrap();
    ct.stop(&engine, Duration::from_millis(100)).unwrap();
    assert_eq!(ct.state(), ContainerState::Stopped);
}

#[test]
fn destroy_unlinks_whole_subtree() {
    let engine = engine();
    let a = engine
        .create_container("a", Cred::new(0, 0), |_| Ok(()))
        .unwrap();
    let b = engine
        .create_container("a/b", Cred::new(0, 0), |_| Ok(()))
        .unwrap();
    let (a_id, b_id) = (a.id, b.id);

    a.destroy(&engine).unwrap();

    assert!(engine.registry.find("a").is_none());
    assert!(engine.registry.find("a/b").is_none());
    assert_eq!(a.state(), ContainerState::Destroyed);
    assert_eq!(b.state(), ContainerState::Destroyed);
    assert!(engine.kv.load(a_id).is_err());
    assert!(engine.kv.load(b_id).is_err());

    // The names are free again.
    engine
        .create_container("a", Cred::new(0, 0), |_| Ok(()))
        .unwrap();
}

#[test]
fn destroy_missing_container_is_a_lookup_error() {
    let engine = engine();
    let err = engine.registry.resolve("nope").unwrap_err();
    assert_eq!(err.kind, warren_core::ErrorKind::ContainerDoesNotExist);
}

#[test]
fn waiter_resolves_when_container_stops() {
    let engine = engine();
    let ct = engine
        .create_container("job", Cred::new(0, 0), |_| Ok(()))
        .unwrap();
    ct.change_state(ContainerState::Running, &engine.wildcard_waiters);

    let (waiter, mut rx) = Waiter::new(String::new(), Vec::new());
    ct.add_waiter(&waiter);
    assert!(rx.try_recv().is_err());

    ct.stop(&engine, Duration::ZERO).unwrap();

    let result = rx.try_recv().unwrap();
    assert_eq!(result.name, "job");
    assert!(result.error.is_none());
}

#[test]
fn wildcard_waiter_sees_sibling_death() {
    let engine = engine();
    let ct = engine
        .create_container("job-1", Cred::new(0, 0), |_| Ok(()))
        .unwrap();
    ct.change_state(ContainerState::Running, &engine.wildcard_waiters);

    let (waiter, mut rx) = Waiter::new(String::new(), vec!["job-*".to_string()]);
    engine.wildcard_waiters.add(&waiter);

    ct.stop(&engine, Duration::ZERO).unwrap();
    assert_eq!(rx.try_recv().unwrap().name, "job-1");
}

#[test]
fn respawn_gate_schedules_an_event() {
    let engine = engine();
    let ct = engine
        .create_container("r", Cred::new(0, 0), |_| Ok(()))
        .unwrap();
    warren_core::props::set_property(&ct, &engine, "command", "/bin/false").unwrap();
    warren_core::props::set_property(&ct, &engine, "respawn", "true").unwrap();
    warren_core::props::set_property(&ct, &engine, "max_respawns", "3").unwrap();

    // The root is Meta, so a Dead child with budget left may respawn.
    ct.lock_inner().state = ContainerState::Dead;
    assert!(ct.may_respawn());

    assert!(engine.events.is_empty());
    ct.schedule_respawn(&engine);
    assert_eq!(engine.events.len(), 1);

    ct.lock_inner().runtime.respawn_count = 3;
    assert!(!ct.may_respawn());
}

#[tokio::test]
async fn destroy_weak_event_removes_container() {
    let engine = engine();
    let ct = engine
        .create_container("ephemeral", Cred::new(0, 0), |_| Ok(()))
        .unwrap();
    ct.lock_inner().is_weak = true;

    engine
        .dispatch_event(Event::DestroyWeak {
            ct: Arc::downgrade(&ct),
        })
        .await;

    assert!(engine.registry.find("ephemeral").is_none());
    assert_eq!(ct.state(), ContainerState::Destroyed);
}

#[tokio::test]
async fn rotation_tick_destroys_aged_dead_containers() {
    let engine = engine();
    let ct = engine
        .create_container("old", Cred::new(0, 0), |_| Ok(()))
        .unwrap();
    warren_core::props::set_property(&ct, &engine, "aging_time", "0").unwrap();
    {
        let mut inner = ct.lock_inner();
        inner.state = ContainerState::Dead;
        inner.runtime.death_time_ms = wall_ms().saturating_sub(10_000);
    }
    assert!(ct.expired());

    engine.dispatch_event(Event::RotateLogs).await;

    assert!(engine.registry.find("old").is_none());
    // The tick re-arms itself.
    assert_eq!(engine.events.len(), 1);
}

#[test]
fn restored_engine_preserves_ids_and_properties() {
    let engine = engine();
    let ct = engine
        .create_container("svc", Cred::new(0, 0), |_| Ok(()))
        .unwrap();
    warren_core::props::set_property(&ct, &engine, "command", "/bin/sleep 5").unwrap();
    warren_core::props::set_property(&ct, &engine, "memory_limit", "8388608").unwrap();
    let id = ct.id;

    let second = Engine::new(engine.config.clone()).unwrap();
    second.restore_all().unwrap();
    let restored = second.registry.resolve("svc").unwrap();
    assert_eq!(restored.id, id);
    assert_eq!(
        warren_core::props::get_property(&restored, &second, "memory_limit").unwrap(),
        "8388608"
    );
    assert_eq!(restored.state(), ContainerState::Stopped);
}

/// End-to-end start of a real command; needs root, cgroup-v1 freezer and
/// the warren-init helper installed next to the test binary.
#[test]
#[ignore = "requires root and a cgroup-v1 hierarchy"]
fn start_observes_exit_of_short_command() {
    let engine = engine();
    let ct = engine
        .create_container("a", Cred::new(0, 0), |_| Ok(()))
        .unwrap();
    warren_core::props::set_property(&ct, &engine, "command", "/bin/true").unwrap();
    ct.start(&engine, true).unwrap();
    assert_eq!(ct.state(), ContainerState::Running);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        let pid = ct.lock_inner().runtime.wait_pid;
        if pid != 0 && !std::path::Path::new(&format!("/proc/{pid}")).exists() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    ct.stop(&engine, Duration::from_secs(1)).unwrap();
    assert_eq!(ct.state(), ContainerState::Stopped);
}
