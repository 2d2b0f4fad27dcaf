//! The property surface of a container.
//!
//! Every named knob a client can read or write goes through this table:
//! get/set for the RPC, serialization for the on-disk snapshot, and the
//! settable-while-running rules. Names with a dot are passed through to
//! the matching cgroup knob read-only.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::caps::CapSet;
use crate::cgroup::{self, Subsystem};
use crate::container::{BindMount, Container, Prop, VirtMode};
use crate::cred::AccessLevel;
use crate::engine::Engine;
use crate::error::{Error, ErrorKind, Result};
use crate::net::{format_rate_map, parse_rate_map, NetMode};
use crate::persist::{KvRecord, KEY_ID, KEY_NAME, KEY_STATE};
use crate::state::ContainerState;

struct PropInfo {
    name: &'static str,
    prop: Prop,
    /// Settable while the container is running.
    dynamic: bool,
}

const SETTABLE: &[PropInfo] = &[
    PropInfo { name: "command", prop: Prop::Command, dynamic: false },
    PropInfo { name: "cwd", prop: Prop::Cwd, dynamic: false },
    PropInfo { name: "env", prop: Prop::Env, dynamic: false },
    PropInfo { name: "isolate", prop: Prop::Isolate, dynamic: false },
    PropInfo { name: "virt_mode", prop: Prop::VirtMode, dynamic: false },
    PropInfo { name: "root", prop: Prop::Root, dynamic: false },
    PropInfo { name: "root_readonly", prop: Prop::RootRo, dynamic: false },
    PropInfo { name: "bind_dns", prop: Prop::BindDns, dynamic: false },
    PropInfo { name: "hostname", prop: Prop::Hostname, dynamic: false },
    PropInfo { name: "resolv_conf", prop: Prop::ResolvConf, dynamic: false },
    PropInfo { name: "umask", prop: Prop::Umask, dynamic: false },
    PropInfo { name: "user", prop: Prop::User, dynamic: false },
    PropInfo { name: "group", prop: Prop::Group, dynamic: false },
    PropInfo { name: "stdin_path", prop: Prop::Stdin, dynamic: false },
    PropInfo { name: "stdout_path", prop: Prop::Stdout, dynamic: false },
    PropInfo { name: "stderr_path", prop: Prop::Stderr, dynamic: false },
    PropInfo { name: "stdout_limit", prop: Prop::StdoutLimit, dynamic: true },
    PropInfo { name: "net", prop: Prop::Net, dynamic: false },
    PropInfo { name: "net_priority", prop: Prop::NetPriority, dynamic: true },
    PropInfo { name: "net_guarantee", prop: Prop::NetGuarantee, dynamic: true },
    PropInfo { name: "net_limit", prop: Prop::NetLimit, dynamic: true },
    PropInfo { name: "memory_limit", prop: Prop::MemLimit, dynamic: true },
    PropInfo { name: "memory_guarantee", prop: Prop::MemGuarantee, dynamic: true },
    PropInfo { name: "anon_limit", prop: Prop::AnonLimit, dynamic: true },
    PropInfo { name: "dirty_limit", prop: Prop::DirtyLimit, dynamic: true },
    PropInfo { name: "recharge_on_pgfault", prop: Prop::RechargeOnPgfault, dynamic: true },
    PropInfo { name: "cpu_policy", prop: Prop::CpuPolicy, dynamic: true },
    PropInfo { name: "cpu_limit", prop: Prop::CpuLimit, dynamic: true },
    PropInfo { name: "cpu_guarantee", prop: Prop::CpuGuarantee, dynamic: true },
    PropInfo { name: "io_policy", prop: Prop::IoPolicy, dynamic: true },
    PropInfo { name: "io_limit", prop: Prop::IoLimit, dynamic: true },
    PropInfo { name: "io_ops_limit", prop: Prop::IoOpsLimit, dynamic: true },
    PropInfo { name: "respawn", prop: Prop::Respawn, dynamic: true },
    PropInfo { name: "max_respawns", prop: Prop::MaxRespawns, dynamic: true },
    PropInfo { name: "respawn_count", prop: Prop::RespawnCount, dynamic: true },
    PropInfo { name: "aging_time", prop: Prop::AgingTime, dynamic: true },
    PropInfo { name: "namespace", prop: Prop::NsName, dynamic: false },
    PropInfo { name: "capabilities", prop: Prop::Capabilities, dynamic: false },
    PropInfo { name: "capabilities_ambient", prop: Prop::CapAmbient, dynamic: false },
    PropInfo { name: "devices", prop: Prop::Devices, dynamic: false },
    PropInfo { name: "bind", prop: Prop::Bind, dynamic: false },
    PropInfo { name: "ulimit", prop: Prop::Ulimit, dynamic: false },
    PropInfo { name: "controllers", prop: Prop::Controllers, dynamic: false },
    PropInfo { name: "access_level", prop: Prop::AccessLevel, dynamic: true },
    PropInfo { name: "weak", prop: Prop::Weak, dynamic: true },
    PropInfo { name: "private", prop: Prop::Private, dynamic: true },
];

const READ_ONLY: &[&str] = &[
    "state",
    "id",
    "level",
    "absolute_name",
    "exit_status",
    "oom_killed",
    "root_pid",
    "start_time",
    "death_time",
];

fn info(name: &str) -> Option<&'static PropInfo> {
    SETTABLE.iter().find(|info| info.name == name)
}

fn bad_bool(value: &str) -> Error {
    Error::new(ErrorKind::InvalidValue, format!("expected true or false, got '{value}'"))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(bad_bool(value)),
    }
}

fn parse_u64(value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("bad number '{value}'")))
}

fn format_bool(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads a property value.
///
/// # Errors
///
/// `InvalidProperty` for unknown names, `InvalidState` for cgroup
/// attributes of a stopped container.
pub fn get_property(ct: &Arc<Container>, engine: &Arc<Engine>, name: &str) -> Result<String> {
    if let Some((subsys, _)) = name.split_once('.') {
        if let Some(subsystem) = subsystem_by_dir(subsys) {
            if ct.state() == ContainerState::Stopped {
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    format!("not available in stopped state: {name}"),
                ));
            }
            let cg = ct.cgroup(subsystem, &engine.config);
            if !cg.has(name) {
                return Err(Error::new(
                    ErrorKind::InvalidProperty,
                    format!("unknown cgroup attribute: {name}"),
                ));
            }
            return cg.get(name);
        }
    }
    get_local(ct, name)
}

/// Property read that needs no engine; cgroup passthrough names are not
/// valid here.
fn get_local(ct: &Arc<Container>, name: &str) -> Result<String> {
    let inner = ct.lock_inner();
    let spec = &inner.spec;
    let value = match name {
        "command" => spec.command.clone(),
        "cwd" => spec.cwd.display().to_string(),
        "env" => spec.env.join(";"),
        "isolate" => format_bool(spec.isolate),
        "virt_mode" => spec.virt_mode.to_string(),
        "root" => spec.root.display().to_string(),
        "root_readonly" => format_bool(spec.root_ro),
        "bind_dns" => format_bool(spec.bind_dns),
        "hostname" => spec.hostname.clone(),
        "resolv_conf" => spec.resolv_conf.join(";"),
        "umask" => format!("{:04o}", spec.umask),
        "user" => spec.owner.user_name(),
        "group" => spec.owner.gid.to_string(),
        "stdin_path" => spec.stdin_path.display().to_string(),
        "stdout_path" => spec.stdout_path.display().to_string(),
        "stderr_path" => spec.stderr_path.display().to_string(),
        "stdout_limit" => spec.stdout_limit.to_string(),
        "net" => spec.net.mode.to_string(),
        "net_priority" => format_rate_map(&spec.net.priority),
        "net_guarantee" => format_rate_map(&spec.net.guarantee),
        "net_limit" => format_rate_map(&spec.net.limit),
        "memory_limit" => spec.mem_limit.to_string(),
        "memory_guarantee" => spec.mem_guarantee.to_string(),
        "anon_limit" => spec.anon_limit.to_string(),
        "dirty_limit" => spec.dirty_limit.to_string(),
        "recharge_on_pgfault" => format_bool(spec.recharge_on_pgfault),
        "cpu_policy" => spec.cpu_policy.clone(),
        "cpu_limit" => format!("{}", spec.cpu_limit),
        "cpu_guarantee" => format!("{}", spec.cpu_guarantee),
        "io_policy" => spec.io_policy.clone(),
        "io_limit" => spec.io_limit.to_string(),
        "io_ops_limit" => spec.io_ops_limit.to_string(),
        "respawn" => format_bool(spec.respawn),
        "max_respawns" => spec.max_respawns.to_string(),
        "respawn_count" => inner.runtime.respawn_count.to_string(),
        "aging_time" => spec.aging_time.as_secs().to_string(),
        "namespace" => spec.ns_name.clone(),
        "capabilities" => spec.cap_limit.format(),
        "capabilities_ambient" => spec.cap_ambient.format(),
        "devices" => spec.devices.join(";"),
        "bind" => spec
            .bind_mounts
            .iter()
            .map(BindMount::format)
            .collect::<Vec<_>>()
            .join(";"),
        "ulimit" => {
            let mut entries: Vec<_> = spec
                .rlimits
                .iter()
                .map(|(name, (soft, hard))| format!("{name}: {soft} {hard}"))
                .collect();
            entries.sort();
            entries.join("; ")
        }
        "controllers" => format_controllers(spec.controllers),
        "access_level" => spec.access_level.to_string(),
        "weak" => format_bool(inner.is_weak),
        "private" => spec.private.clone(),
        "state" => inner.state.to_string(),
        "id" => ct.id.to_string(),
        "level" => ct.level.to_string(),
        "absolute_name" => ct.name.clone(),
        "exit_status" => inner.runtime.exit_status.to_string(),
        "oom_killed" => format_bool(inner.runtime.oom_killed),
        "root_pid" => inner.runtime.task_pid.to_string(),
        "start_time" => inner.runtime.start_time_ms.to_string(),
        "death_time" => inner.runtime.death_time_ms.to_string(),
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidProperty,
                format!("unknown container property: {name}"),
            ))
        }
    };
    Ok(value)
}

/// Parses and assigns a property value without any state rules; shared
/// by the RPC path and restore.
///
/// # Errors
///
/// `InvalidProperty` for unknown or read-only names, `InvalidValue` for
/// unparsable values.
pub fn set_raw(ct: &Arc<Container>, name: &str, value: &str) -> Result<Prop> {
    let info = info(name).ok_or_else(|| {
        if READ_ONLY.contains(&name) {
            Error::new(ErrorKind::InvalidProperty, format!("property is read-only: {name}"))
        } else {
            Error::new(ErrorKind::InvalidProperty, format!("unknown container property: {name}"))
        }
    })?;
    let value = value.trim();

    let mut inner = ct.lock_inner();
    let spec = &mut inner.spec;
    match info.prop {
        Prop::Command => spec.command = value.to_string(),
        Prop::Cwd => spec.cwd = PathBuf::from(value),
        Prop::Env => {
            let entries = split_list(value);
            for entry in &entries {
                if !entry.contains('=') {
                    return Err(Error::new(
                        ErrorKind::InvalidValue,
                        format!("expected KEY=VALUE in env entry '{entry}'"),
                    ));
                }
            }
            spec.env = entries;
        }
        Prop::Isolate => spec.isolate = parse_bool(value)?,
        Prop::VirtMode => spec.virt_mode = VirtMode::parse(value)?,
        Prop::Root => {
            if value.is_empty() {
                return Err(Error::new(ErrorKind::InvalidValue, "empty root path"));
            }
            spec.root = PathBuf::from(value);
        }
        Prop::RootRo => spec.root_ro = parse_bool(value)?,
        Prop::BindDns => spec.bind_dns = parse_bool(value)?,
        Prop::Hostname => spec.hostname = value.to_string(),
        Prop::ResolvConf => spec.resolv_conf = split_list(value),
        Prop::Umask => {
            spec.umask = u32::from_str_radix(value, 8)
                .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("bad umask '{value}'")))?;
        }
        Prop::User => {
            // A name from the passwd database or a bare numeric uid.
            match nix::unistd::User::from_name(value).map_err(Error::from)? {
                Some(user) => {
                    spec.owner.uid = user.uid.as_raw();
                    spec.owner.gid = user.gid.as_raw();
                }
                None => {
                    spec.owner.uid = value.parse().map_err(|_| {
                        Error::new(ErrorKind::InvalidValue, format!("unknown user '{value}'"))
                    })?;
                }
            }
            spec.owner.groups.clear();
        }
        Prop::Group => {
            let gid = match crate::cred::group_id(value) {
                Some(gid) => gid,
                None => value.parse().map_err(|_| {
                    Error::new(ErrorKind::InvalidValue, format!("unknown group '{value}'"))
                })?,
            };
            spec.owner.gid = gid;
        }
        Prop::Stdin => spec.stdin_path = PathBuf::from(value),
        Prop::Stdout => spec.stdout_path = PathBuf::from(value),
        Prop::Stderr => spec.stderr_path = PathBuf::from(value),
        Prop::StdoutLimit => spec.stdout_limit = parse_u64(value)?,
        Prop::Net => spec.net.mode = NetMode::parse(value)?,
        Prop::NetPriority => spec.net.priority = parse_rate_map(value)?,
        Prop::NetGuarantee => spec.net.guarantee = parse_rate_map(value)?,
        Prop::NetLimit => spec.net.limit = parse_rate_map(value)?,
        Prop::MemLimit => spec.mem_limit = parse_u64(value)?,
        Prop::MemGuarantee => spec.mem_guarantee = parse_u64(value)?,
        Prop::AnonLimit => spec.anon_limit = parse_u64(value)?,
        Prop::DirtyLimit => spec.dirty_limit = parse_u64(value)?,
        Prop::RechargeOnPgfault => spec.recharge_on_pgfault = parse_bool(value)?,
        Prop::CpuPolicy => {
            if !matches!(value, "normal" | "rt" | "idle") {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("unknown cpu policy '{value}'"),
                ));
            }
            spec.cpu_policy = value.to_string();
        }
        Prop::CpuLimit => {
            spec.cpu_limit = parse_cpus(value)?;
        }
        Prop::CpuGuarantee => {
            spec.cpu_guarantee = parse_cpus(value)?;
        }
        Prop::IoPolicy => {
            if !matches!(value, "normal" | "batch") {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("unknown io policy '{value}'"),
                ));
            }
            spec.io_policy = value.to_string();
        }
        Prop::IoLimit => spec.io_limit = parse_u64(value)?,
        Prop::IoOpsLimit => spec.io_ops_limit = parse_u64(value)?,
        Prop::Respawn => spec.respawn = parse_bool(value)?,
        Prop::MaxRespawns => {
            spec.max_respawns = value.parse().map_err(|_| {
                Error::new(ErrorKind::InvalidValue, format!("bad number '{value}'"))
            })?;
        }
        Prop::RespawnCount => inner.runtime.respawn_count = parse_u64(value)?,
        Prop::AgingTime => spec.aging_time = Duration::from_secs(parse_u64(value)?),
        Prop::NsName => {
            if !value.is_empty() {
                crate::name::valid_name(value, 128, 128)?;
            }
            spec.ns_name = value.to_string();
        }
        Prop::Capabilities => spec.cap_limit = CapSet::parse(value)?,
        Prop::CapAmbient => spec.cap_ambient = CapSet::parse(value)?,
        Prop::Devices => {
            spec.devices = split_list(value);
        }
        Prop::Bind => {
            let mut mounts = Vec::new();
            for entry in split_list(value) {
                mounts.push(BindMount::parse(&entry)?);
            }
            spec.bind_mounts = mounts;
        }
        Prop::Ulimit => {
            let mut limits = std::collections::HashMap::new();
            for entry in split_list(value) {
                let (name, rest) = entry.split_once(':').ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidValue,
                        format!("expected 'name: soft hard' in '{entry}'"),
                    )
                })?;
                let name = name.trim().to_string();
                crate::spawn::rlimit_name_valid(&name)?;
                let mut fields = rest.split_whitespace();
                let soft = parse_u64(fields.next().unwrap_or(""))?;
                let hard = parse_u64(fields.next().unwrap_or(""))?;
                if soft > hard {
                    return Err(Error::new(
                        ErrorKind::InvalidValue,
                        format!("soft limit above hard limit in '{entry}'"),
                    ));
                }
                limits.insert(name, (soft, hard));
            }
            spec.rlimits = limits;
        }
        Prop::Controllers => {
            let mask = parse_controllers(value)?;
            if mask & spec.required_controllers != spec.required_controllers {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    "the freezer controller cannot be disabled",
                ));
            }
            spec.controllers = mask;
        }
        Prop::AccessLevel => spec.access_level = AccessLevel::parse(value)?,
        Prop::Weak => inner.is_weak = parse_bool(value)?,
        Prop::Private => spec.private = value.to_string(),
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidProperty,
                format!("property is read-only: {name}"),
            ))
        }
    }
    drop(inner);
    ct.set_prop(info.prop);
    Ok(info.prop)
}

/// Sets a property through the full RPC rules: the root is read-only,
/// static properties need a Stopped container, dynamic writes re-apply
/// to the kernel and roll back on failure, and the snapshot is saved.
///
/// # Errors
///
/// As [`set_raw`], plus `InvalidState` and kernel write failures.
pub fn set_property(
    ct: &Arc<Container>,
    engine: &Arc<Engine>,
    name: &str,
    value: &str,
) -> Result<()> {
    if ct.is_root() {
        return Err(Error::new(ErrorKind::Permission, "the root container is read-only"));
    }
    let info = info(name).ok_or_else(|| {
        if READ_ONLY.contains(&name) {
            Error::new(ErrorKind::InvalidProperty, format!("property is read-only: {name}"))
        } else {
            Error::new(ErrorKind::InvalidProperty, format!("unknown container property: {name}"))
        }
    })?;

    let state = ct.state();
    if !info.dynamic && state != ContainerState::Stopped {
        return Err(Error::new(
            ErrorKind::InvalidState,
            format!("{name} may only change while stopped"),
        ));
    }

    let old_value = get_property(ct, engine, name)?;
    set_raw(ct, name, value)?;

    if matches!(
        state,
        ContainerState::Running | ContainerState::Meta | ContainerState::Paused
    ) {
        if let Err(err) = ct.apply_dynamic_properties(engine) {
            let _ = set_raw(ct, name, &old_value);
            ct.test_clear_dirty(info.prop);
            return Err(err);
        }
    }

    ct.save(engine)
}

fn parse_cpus(value: &str) -> Result<f64> {
    let text = value.trim().trim_end_matches('c').trim();
    text.parse()
        .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("bad cpu value '{value}'")))
}

fn subsystem_by_dir(dir: &str) -> Option<Subsystem> {
    cgroup::SUBSYSTEMS
        .iter()
        .copied()
        .find(|subsystem| subsystem.dir() == dir)
}

fn format_controllers(mask: u32) -> String {
    cgroup::SUBSYSTEMS
        .iter()
        .filter(|subsystem| mask & subsystem.controller() != 0)
        .map(|subsystem| subsystem.dir())
        .collect::<Vec<_>>()
        .join(";")
}

fn parse_controllers(value: &str) -> Result<u32> {
    let mut mask = 0;
    for name in split_list(value) {
        let subsystem = subsystem_by_dir(&name).ok_or_else(|| {
            Error::new(ErrorKind::InvalidValue, format!("unknown controller '{name}'"))
        })?;
        mask |= subsystem.controller();
    }
    Ok(mask)
}

/// Builds the persisted snapshot: the reserved keys plus every property
/// with its set bit.
#[must_use]
pub fn build_record(ct: &Arc<Container>) -> KvRecord {
    let mut record = KvRecord::new();
    record.insert(KEY_ID.to_string(), ct.id.to_string());
    record.insert(KEY_NAME.to_string(), ct.name.clone());
    record.insert(KEY_STATE.to_string(), ct.state().to_string());

    for info in SETTABLE {
        if !ct.has_prop(info.prop) {
            continue;
        }
        // A value that cannot be read back is dropped from the snapshot
        // rather than blocking the save.
        if let Ok(value) = get_local(ct, info.name) {
            record.insert(info.name.to_string(), value);
        }
    }

    // Runtime keys needed to pick a container back up after a restart.
    let inner = ct.lock_inner();
    if ct.has_prop(Prop::RootPid) {
        record.insert("root_pid".to_string(), inner.runtime.task_pid.to_string());
        record.insert("wait_pid".to_string(), inner.runtime.wait_pid.to_string());
        record.insert("vpid".to_string(), inner.runtime.task_vpid.to_string());
    }
    if ct.has_prop(Prop::StartTime) {
        record.insert("start_time".to_string(), inner.runtime.start_time_ms.to_string());
    }
    if ct.has_prop(Prop::DeathTime) {
        record.insert("death_time".to_string(), inner.runtime.death_time_ms.to_string());
    }
    if ct.has_prop(Prop::ExitStatus) {
        record.insert("exit_status".to_string(), inner.runtime.exit_status.to_string());
    }
    if ct.has_prop(Prop::OomKilled) {
        record.insert("oom_killed".to_string(), format_bool(inner.runtime.oom_killed));
    }
    record
}

/// Replays a persisted snapshot into a freshly restored record.
///
/// Unknown keys are skipped with a warning; the state key is applied
/// last because property semantics depend on it.
pub fn load_record(ct: &Arc<Container>, record: &KvRecord) {
    use tracing::warn;

    for (key, value) in record {
        match key.as_str() {
            KEY_ID | KEY_NAME | KEY_STATE => continue,
            "root_pid" => {
                ct.lock_inner().runtime.task_pid = value.parse().unwrap_or(0);
                ct.set_prop(Prop::RootPid);
            }
            "wait_pid" => ct.lock_inner().runtime.wait_pid = value.parse().unwrap_or(0),
            "vpid" => ct.lock_inner().runtime.task_vpid = value.parse().unwrap_or(0),
            "start_time" => {
                ct.lock_inner().runtime.start_time_ms = value.parse().unwrap_or(0);
                ct.set_prop(Prop::StartTime);
            }
            "death_time" => {
                ct.lock_inner().runtime.death_time_ms = value.parse().unwrap_or(0);
                ct.set_prop(Prop::DeathTime);
            }
            "exit_status" => {
                ct.lock_inner().runtime.exit_status = value.parse().unwrap_or(0);
                ct.set_prop(Prop::ExitStatus);
            }
            "oom_killed" => {
                ct.lock_inner().runtime.oom_killed = value == "true";
                ct.set_prop(Prop::OomKilled);
            }
            _ => {
                if let Err(err) = set_raw(ct, key, value) {
                    warn!(name = %ct.name, key, %err, "cannot load property, skipped");
                }
            }
        }
    }

    let state = record
        .get(KEY_STATE)
        .and_then(|value| ContainerState::parse(value).ok())
        .unwrap_or(ContainerState::Stopped);
    ct.lock_inner().state = state;
    ct.set_prop(Prop::State);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::registry::Registry;

    fn setup() -> (Arc<Engine>, Arc<Container>) {
        let engine = Engine::for_tests();
        let ct = engine
            .registry
            .create("a", crate::cred::Cred::new(1000, 1000), &engine.config, |_| Ok(()))
            .unwrap();
        (engine, ct)
    }

    #[test]
    fn get_defaults() {
        let (engine, ct) = setup();
        assert_eq!(get_property(&ct, &engine, "state").unwrap(), "stopped");
        assert_eq!(get_property(&ct, &engine, "isolate").unwrap(), "true");
        assert_eq!(get_property(&ct, &engine, "virt_mode").unwrap(), "app");
        assert_eq!(get_property(&ct, &engine, "memory_limit").unwrap(), "0");
        assert_eq!(get_property(&ct, &engine, "umask").unwrap(), "0002");
        assert!(get_property(&ct, &engine, "bogus").is_err());
    }

    #[test]
    fn set_and_read_back() {
        let (engine, ct) = setup();
        set_property(&ct, &engine, "command", "/bin/sleep 10").unwrap();
        set_property(&ct, &engine, "memory_limit", "4194304").unwrap();
        set_property(&ct, &engine, "env", "A=1;B=2").unwrap();
        set_property(&ct, &engine, "ulimit", "nofile: 1024 2048").unwrap();
        assert_eq!(get_property(&ct, &engine, "command").unwrap(), "/bin/sleep 10");
        assert_eq!(get_property(&ct, &engine, "memory_limit").unwrap(), "4194304");
        assert_eq!(get_property(&ct, &engine, "env").unwrap(), "A=1;B=2");
        assert_eq!(
            get_property(&ct, &engine, "ulimit").unwrap(),
            "nofile: 1024 2048"
        );
        assert!(ct.has_prop(Prop::Command));
    }

    #[test]
    fn rejects_bad_values() {
        let (engine, ct) = setup();
        assert!(set_property(&ct, &engine, "isolate", "maybe").is_err());
        assert!(set_property(&ct, &engine, "env", "NOEQUALS").is_err());
        assert!(set_property(&ct, &engine, "ulimit", "nofile: 10 5").is_err());
        assert!(set_property(&ct, &engine, "controllers", "freezer;warp").is_err());
        assert!(set_property(&ct, &engine, "controllers", "memory").is_err());
    }

    #[test]
    fn read_only_props_rejected() {
        let (engine, ct) = setup();
        let err = set_property(&ct, &engine, "state", "running").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidProperty);
        let err = set_property(&ct, &engine, "exit_status", "1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidProperty);
    }

    #[test]
    fn root_is_read_only() {
        let engine = Engine::for_tests();
        let root = engine.registry.root();
        let err = set_property(&root, &engine, "command", "/bin/true").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Permission);
    }

    #[test]
    fn static_props_need_stopped() {
        let (engine, ct) = setup();
        ct.lock_inner().state = ContainerState::Running;
        let err = set_property(&ct, &engine, "command", "/bin/true").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn snapshot_round_trip() {
        let (engine, ct) = setup();
        set_property(&ct, &engine, "command", "/bin/true").unwrap();
        set_property(&ct, &engine, "respawn", "true").unwrap();
        set_property(&ct, &engine, "max_respawns", "3").unwrap();
        set_property(&ct, &engine, "capabilities", "KILL;NET_RAW").unwrap();

        let record = build_record(&ct);
        assert_eq!(record[KEY_NAME], "a");
        assert_eq!(record["command"], "/bin/true");

        let config = DaemonConfig::default();
        let registry = Registry::new(&config);
        let other = registry.restore("a", 9, &config).unwrap();
        load_record(&other, &record);
        assert_eq!(other.lock_inner().spec.command, "/bin/true");
        assert!(other.lock_inner().spec.respawn);
        assert_eq!(other.lock_inner().spec.max_respawns, 3);
        assert_eq!(
            other.lock_inner().spec.cap_limit.format(),
            "KILL;NET_RAW"
        );
    }
}
