//! Request dispatcher: one handler per RPC, routed by the set
//! sub-request of the envelope.
//!
//! Handlers resolve and lock their target through the session (which
//! keeps the lock until the request completes), run blocking lifecycle
//! work on blocking threads, and map engine errors onto the shared
//! status code. `Wait` is the one parking handler: it registers a waiter
//! and holds the connection, never a container lock, until it fires.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use warren_core::container::{Container, Prop};
use warren_core::cred::AccessLevel;
use warren_core::error::{Error, ErrorKind, Result};
use warren_core::events::Event;
use warren_core::props;
use warren_core::state::ContainerState;
use warren_core::waiter::{glob_match, Waiter};
use warren_core::Engine;

use crate::client::ClientSession;
use crate::protocol::messages::{
    ContainerRequest, ContainerResponse, CreateRequest, CreateVolumeRequest, GetPropertyRequest,
    KillRequest, LinkVolumeRequest, ListRequest, ListResponse, SetPropertyRequest, StopRequest,
    ValueResponse, VolumeResponse, WaitRequest, WaitResponse,
};

/// Routes a decoded request to its handler and shapes the reply.
pub async fn handle(session: &mut ClientSession, request: ContainerRequest) -> ContainerResponse {
    let result = route(session, request).await;
    match result {
        Ok(response) => response,
        Err(err) => {
            debug!(%err, "request failed");
            ContainerResponse::from_error(&err)
        }
    }
}

async fn route(
    session: &mut ClientSession,
    request: ContainerRequest,
) -> Result<ContainerResponse> {
    if let Some(req) = request.create {
        return create(session, req).await;
    }
    if let Some(req) = request.destroy {
        let ct = session.write_container(&req.name).await?;
        run_blocking(session.engine(), ct, |engine, ct| ct.destroy(engine)).await?;
        return Ok(ContainerResponse::ok());
    }
    if let Some(req) = request.list {
        return list(session, &req);
    }
    if let Some(req) = request.start {
        let superuser = session.identity().is_superuser();
        let ct = session.write_container(&req.name).await?;
        run_blocking(session.engine(), ct, move |engine, ct| {
            ct.start(engine, superuser)
        })
        .await?;
        return Ok(ContainerResponse::ok());
    }
    if let Some(req) = request.stop {
        return stop(session, req).await;
    }
    if let Some(req) = request.pause {
        let ct = session.write_container(&req.name).await?;
        run_blocking(session.engine(), ct, |engine, ct| ct.pause(engine)).await?;
        return Ok(ContainerResponse::ok());
    }
    if let Some(req) = request.resume {
        let ct = session.write_container(&req.name).await?;
        run_blocking(session.engine(), ct, |engine, ct| ct.resume(engine)).await?;
        return Ok(ContainerResponse::ok());
    }
    if let Some(req) = request.kill {
        return kill(session, req).await;
    }
    if let Some(req) = request.get_property.or(request.get_data) {
        return get_property(session, req).await;
    }
    if let Some(req) = request.set_property {
        return set_property(session, req).await;
    }
    if let Some(req) = request.wait {
        return wait(session, req).await;
    }
    if let Some(req) = request.create_volume {
        return create_volume(session, req);
    }
    if let Some(req) = request.link_volume {
        return link_volume(session, req, true);
    }
    if let Some(req) = request.unlink_volume {
        return link_volume(session, req, false);
    }
    Err(Error::new(ErrorKind::InvalidValue, "empty request"))
}

/// Runs blocking lifecycle work while the session's lock stays held.
async fn run_blocking<R, F>(engine: &Arc<Engine>, ct: Arc<Container>, work: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce(&Arc<Engine>, &Arc<Container>) -> Result<R> + Send + 'static,
{
    let engine = engine.clone();
    tokio::task::spawn_blocking(move || work(&engine, &ct))
        .await
        .map_err(|_| Error::new(ErrorKind::Unknown, "worker panicked"))?
}

async fn create(session: &mut ClientSession, req: CreateRequest) -> Result<ContainerResponse> {
    if session.identity().access_level <= AccessLevel::ReadOnly {
        return Err(Error::new(ErrorKind::Permission, "no write access at all"));
    }
    let identity = session.identity().clone();
    let name = identity.resolve(&req.name)?;
    let ct = session.engine().create_container(&name, identity.cred.clone(), |parent| {
        identity.can_control(parent, true)
    })?;

    if req.weak == Some(true) {
        ct.lock_inner().is_weak = true;
        ct.set_prop(Prop::Weak);
        session.track_weak(&ct);
        if let Err(err) = ct.save(session.engine()) {
            debug!(name = %ct.name, %err, "cannot save weak flag");
        }
    }
    Ok(ContainerResponse::ok())
}

fn list(session: &ClientSession, req: &ListRequest) -> Result<ContainerResponse> {
    let identity = session.identity();
    let mut names = Vec::new();
    for name in session.engine().registry.names() {
        let Ok(relative) = identity.compose(&name) else {
            continue;
        };
        if relative == "self" {
            continue;
        }
        if let Some(mask) = &req.mask {
            if !glob_match(mask, &relative) {
                continue;
            }
        }
        names.push(relative);
    }
    Ok(ContainerResponse {
        list: Some(ListResponse { name: names }),
        ..ContainerResponse::ok()
    })
}

async fn stop(session: &mut ClientSession, req: StopRequest) -> Result<ContainerResponse> {
    let timeout = req
        .timeout_ms
        .map_or(session.engine().config.container.stop_timeout, Duration::from_millis);
    let ct = session.write_container(&req.name).await?;
    run_blocking(session.engine(), ct, move |engine, ct| {
        ct.stop(engine, timeout)
    })
    .await?;
    Ok(ContainerResponse::ok())
}

async fn kill(session: &mut ClientSession, req: KillRequest) -> Result<ContainerResponse> {
    let signal = nix::sys::signal::Signal::try_from(req.sig)
        .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("bad signal {}", req.sig)))?;
    let ct = session.write_container(&req.name).await?;
    ct.kill(signal)?;
    Ok(ContainerResponse::ok())
}

async fn get_property(
    session: &mut ClientSession,
    req: GetPropertyRequest,
) -> Result<ContainerResponse> {
    let ct = session.read_container(&req.name).await?;
    let value = props::get_property(&ct, session.engine(), &req.property)?;
    Ok(ContainerResponse {
        value: Some(ValueResponse { value }),
        ..ContainerResponse::ok()
    })
}

async fn set_property(
    session: &mut ClientSession,
    req: SetPropertyRequest,
) -> Result<ContainerResponse> {
    let identity = session.identity().clone();
    let ct = session.write_container(&req.name).await?;

    // Handing a container to another owner needs control over that
    // owner, not just over the container.
    if req.property == "user" {
        let user = nix::unistd::User::from_name(req.value.trim())
            .map_err(Error::from)?
            .ok_or_else(|| {
                Error::new(ErrorKind::InvalidValue, format!("unknown user '{}'", req.value))
            })?;
        let mut target = warren_core::cred::Cred::new(user.uid.as_raw(), user.gid.as_raw());
        if let Err(err) = target.load_groups() {
            debug!(%err, "cannot load target user groups");
        }
        identity.can_control_cred(&target)?;
    }
    if req.property == "group" && !identity.is_superuser() {
        let gid = warren_core::cred::group_id(req.value.trim()).ok_or_else(|| {
            Error::new(ErrorKind::InvalidValue, format!("unknown group '{}'", req.value))
        })?;
        if !identity.cred.is_member_of(gid) {
            return Err(Error::new(
                ErrorKind::Permission,
                format!("user {} is not in group {}", identity.cred, req.value),
            ));
        }
    }

    let engine = session.engine().clone();
    run_blocking(&engine, ct, move |engine, ct| {
        props::set_property(ct, engine, &req.property, &req.value)
    })
    .await?;
    Ok(ContainerResponse::ok())
}

async fn wait(session: &mut ClientSession, req: WaitRequest) -> Result<ContainerResponse> {
    let identity = session.identity().clone();
    let engine = session.engine().clone();

    let mut exact = Vec::new();
    let mut wildcards = Vec::new();
    for name in &req.name {
        if name.contains('*') || name.contains('?') {
            wildcards.push(name.clone());
        } else {
            let absolute = identity.resolve(name)?;
            exact.push(engine.registry.resolve(&absolute)?);
        }
    }
    if exact.is_empty() && wildcards.is_empty() {
        return Err(Error::new(ErrorKind::InvalidValue, "wait needs at least one name"));
    }

    let (waiter, rx) = Waiter::new(identity.namespace(), wildcards.clone());
    for ct in &exact {
        ct.add_waiter(&waiter);
    }
    if !wildcards.is_empty() {
        engine.wildcard_waiters.add(&waiter);
    }

    // Containers already in a terminal state resolve the wait at once.
    let candidates = if wildcards.is_empty() {
        exact.clone()
    } else {
        engine.registry.all()
    };
    for ct in candidates {
        if matches!(
            ct.state(),
            ContainerState::Dead | ContainerState::Stopped
        ) && !ct.is_root()
        {
            waiter.wake(Some(&ct));
        }
    }

    if let Some(ms) = req.timeout_ms {
        engine.events.schedule(
            Duration::from_millis(ms),
            Event::WaitTimeout {
                waiter: Arc::downgrade(&waiter),
            },
        );
    }

    // Parked with no lock held; the connection serves nothing else
    // until the waiter fires.
    session.release_container();
    let result = rx
        .await
        .map_err(|_| Error::new(ErrorKind::Unknown, "waiter dropped"))?;
    if let Some(err) = result.error {
        return Err(err);
    }
    Ok(ContainerResponse {
        wait: Some(WaitResponse { name: result.name }),
        ..ContainerResponse::ok()
    })
}

fn create_volume(
    session: &mut ClientSession,
    req: CreateVolumeRequest,
) -> Result<ContainerResponse> {
    let identity = session.identity().clone();
    if identity.access_level <= AccessLevel::ReadOnly {
        return Err(Error::new(ErrorKind::Permission, "no write access at all"));
    }
    let link = match req.container {
        Some(name) => identity.resolve(&name)?,
        None => identity.container.name.clone(),
    };
    let info = session.engine().volumes.create(
        req.path.map(std::path::PathBuf::from),
        identity.cred.clone(),
        Some(link),
    )?;
    Ok(ContainerResponse {
        volume: Some(VolumeResponse {
            path: info.path.display().to_string(),
        }),
        ..ContainerResponse::ok()
    })
}

fn link_volume(
    session: &mut ClientSession,
    req: LinkVolumeRequest,
    link: bool,
) -> Result<ContainerResponse> {
    let identity = session.identity().clone();
    if identity.access_level <= AccessLevel::ReadOnly {
        return Err(Error::new(ErrorKind::Permission, "no write access at all"));
    }
    let container = match req.container {
        Some(name) => identity.resolve(&name)?,
        None => identity.container.name.clone(),
    };
    let path = std::path::PathBuf::from(&req.path);
    let volumes = &session.engine().volumes;
    let info = volumes
        .find(&path)
        .ok_or_else(|| Error::new(ErrorKind::InvalidValue, format!("no volume at {}", req.path)))?;
    if !identity.is_superuser() && info.owner.uid != identity.cred.uid {
        return Err(Error::new(ErrorKind::Permission, "not the volume owner"));
    }
    if link {
        volumes.link(&path, &container)?;
    } else {
        volumes.unlink(&path, &container)?;
    }
    Ok(ContainerResponse {
        volume: Some(VolumeResponse { path: req.path }),
        ..ContainerResponse::ok()
    })
}
