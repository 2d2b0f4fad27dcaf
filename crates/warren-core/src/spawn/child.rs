//! Child-side stages of the spawn protocol.
//!
//! Everything here runs in forked children of the daemon. Failures are
//! reported as error frames on the spawn socket, padded with filler pid
//! reports so the daemon's fixed receive sequence never hangs, and end in
//! `_exit`; nothing unwinds across a fork boundary.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::signal::Signal;
use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::{chdir, chroot, fork, pivot_root, setsid, ForkResult, Pid};

use crate::caps::init_helper_caps;
use crate::error::{Error, ErrorKind, Result};
use crate::spawn::socket::SpawnSocket;
use crate::spawn::{split_command, TaskEnv};

/// Pid reports the daemon expects before the error frame.
const REPORT_STAGES: u8 = 2;

fn die(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

/// Reports the stage failure and exits. Missing pid reports are filled
/// with the caller's own pid so the daemon's receive sequence completes.
fn abort(sock: &SpawnSocket, reported: u8, err: &Error) -> ! {
    for _ in reported..REPORT_STAGES {
        let _ = sock.send_pid(nix::unistd::getpid().as_raw());
    }
    let _ = sock.send_error(err);
    die(1)
}

fn set_name(name: &str) {
    if let Ok(cname) = CString::new(name) {
        let _ = nix::sys::prctl::set_name(&cname);
    }
}

fn die_with_parent() -> Result<()> {
    nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)
        .map_err(|e| Error::os("prctl(PR_SET_PDEATHSIG)", e))
}

/// Broker process body. Never returns.
///
/// The broker carries the construction into the right cgroups and
/// namespaces, forks the task, reports pids and either exits or stays on
/// as the wait task running `warren-init`.
pub(super) fn broker_main(env: &mut TaskEnv, sock: &SpawnSocket, master: &SpawnSocket) -> ! {
    set_name("warren-spawn-b");
    let mut reported: u8 = 0;
    if let Err(err) = broker_body(env, sock, master, &mut reported) {
        abort(sock, reported, &err);
    }
    die(0)
}

fn broker_body(
    env: &mut TaskEnv,
    sock: &SpawnSocket,
    master: &SpawnSocket,
    reported: &mut u8,
) -> Result<()> {
    let _ = setsid();
    die_with_parent()?;

    for cg in &env.cgroups {
        cg.attach(nix::unistd::getpid().as_raw())
            .map_err(|e| e.context("join cgroup"))?;
    }

    if let Some(parent_pid) = env.parent_task_pid {
        enter_namespaces(parent_pid, env)?;
    }

    if env.triple_fork {
        // Hop into the parent's pid namespace: the next fork lands there,
        // and this process exits so the hop reparents to the daemon.
        match unsafe { fork() }.map_err(|e| Error::os("fork pid-ns hop", e))? {
            ForkResult::Parent { .. } => die(0),
            ForkResult::Child => {
                die_with_parent()?;
            }
        }
    }

    let sock2 = if env.quadro_fork {
        Some(SpawnSocket::pair()?)
    } else {
        None
    };

    let mut unshare_flags = nix::sched::CloneFlags::empty();
    if env.isolate {
        unshare_flags |= nix::sched::CloneFlags::CLONE_NEWPID;
        unshare_flags |= nix::sched::CloneFlags::CLONE_NEWIPC;
    }
    if env.new_mount_ns {
        unshare_flags |= nix::sched::CloneFlags::CLONE_NEWNS;
    }
    if env.isolate || !env.hostname.is_empty() {
        unshare_flags |= nix::sched::CloneFlags::CLONE_NEWUTS;
    }
    if !unshare_flags.is_empty() {
        nix::sched::unshare(unshare_flags).map_err(|e| Error::os("unshare()", e))?;
    }

    let task_pid = match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => child,
        Ok(ForkResult::Child) => {
            let task_sock2 = sock2.as_ref().map(|(_, task_end)| task_end);
            task_main(env, sock, task_sock2);
        }
        Err(errno) => {
            let kind = if errno == nix::errno::Errno::ENOMEM {
                ErrorKind::ResourceNotAvailable
            } else {
                ErrorKind::Unknown
            };
            return Err(Error::errno(kind, errno, "fork task"));
        }
    };

    // Wait pid, host view: the broker itself when it stays on as the
    // waiter, the task otherwise.
    if env.triple_fork {
        sock.send_pid(nix::unistd::getpid().as_raw())?;
    } else {
        sock.send_pid(task_pid.as_raw())?;
    }
    *reported += 1;

    // In-namespace pid, when the task will not report it itself.
    if env.isolate && !env.quadro_fork {
        sock.send_pid(task_pid.as_raw())?;
        *reported += 1;
    }

    // Wake the task: its wait pid is on record.
    master.send_wake()?;
    if !env.isolate && !env.quadro_fork {
        *reported += 1; // The task reports its own vpid.
    }

    if let Some((broker_end, task_end)) = sock2 {
        drop(task_end);
        let (app_pid, _app_vpid) = broker_end.recv_pid()?;
        sock.send_pid(app_pid)?;
        *reported += 1;
        broker_end.send_wake()?;
        drop(broker_end);
    }

    if env.triple_fork {
        // Stay on as the wait task: exec the pid-1 helper watching the
        // task from inside the parent's pid namespace.
        init_helper_caps().apply_limit()?;
        exec_init(env, Some(task_pid))?;
    }

    Ok(())
}

fn enter_namespaces(parent_pid: i32, env: &TaskEnv) -> Result<()> {
    use nix::sched::{setns, CloneFlags};

    let open_ns = |kind: &str| -> Result<Option<File>> {
        match File::open(format!("/proc/{parent_pid}/ns/{kind}")) {
            Ok(file) => Ok(Some(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::from(err).context(format!("open ns/{kind}"))),
        }
    };

    for (kind, flag) in [
        ("ipc", CloneFlags::CLONE_NEWIPC),
        ("uts", CloneFlags::CLONE_NEWUTS),
        ("net", CloneFlags::CLONE_NEWNET),
        ("pid", CloneFlags::CLONE_NEWPID),
        ("mnt", CloneFlags::CLONE_NEWNS),
    ] {
        if kind == "net" && env.new_net_ns {
            continue;
        }
        if let Some(file) = open_ns(kind)? {
            setns(file, flag).map_err(|e| Error::os(format!("setns({kind})"), e))?;
        }
    }

    if env.new_net_ns {
        nix::sched::unshare(CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::os("unshare(NEWNET)", e))?;
    }
    Ok(())
}

/// Task process body. Never returns.
fn task_main(env: &mut TaskEnv, sock: &SpawnSocket, sock2: Option<&SpawnSocket>) -> ! {
    set_name("warren-spawn-t");
    // Stage 1, the wait pid, was the broker's report.
    let mut reported: u8 = 1;
    if let Err(err) = task_body(env, sock, sock2, &mut reported) {
        abort(sock, reported, &err);
    }
    die(1)
}

fn task_body(
    env: &mut TaskEnv,
    sock: &SpawnSocket,
    sock2: Option<&SpawnSocket>,
    reported: &mut u8,
) -> Result<()> {
    if env.triple_fork {
        // Die together with the waiter.
        die_with_parent()?;
    }

    // The wait pid must be on record before anything observable happens.
    sock.recv_wake()?;

    if !env.isolate {
        sock.send_pid(nix::unistd::getpid().as_raw())?;
        *reported += 1;
    } else if !env.quadro_fork {
        *reported += 1; // Broker already reported pid 1.
    }

    configure_task(env, sock2, reported)?;

    // Parked: the daemon may still abandon the start here, and no user
    // code has run yet.
    sock.recv_wake()?;

    exec_command(env)
}

fn configure_task(
    env: &mut TaskEnv,
    sock2: Option<&SpawnSocket>,
    reported: &mut u8,
) -> Result<()> {
    apply_rlimits(env)?;

    setsid().map_err(|e| Error::os("setsid()", e))?;
    nix::sys::stat::umask(Mode::empty());

    if env.new_mount_ns {
        // Receive propagation from the parent namespace, leak nothing
        // back.
        remount_root_flags(MsFlags::MS_SLAVE | MsFlags::MS_REC)?;
    }

    if env.isolate {
        let _ = umount2("/proc", MntFlags::MNT_DETACH);
        mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            None::<&str>,
        )
        .map_err(|e| Error::os("mount /proc", e))?;
    }

    let chrooted = env.root != Path::new("/");
    if env.new_mount_ns && !chrooted {
        let _ = umount2("/sys", MntFlags::MNT_DETACH);
        mount(
            Some("sysfs"),
            "/sys",
            Some("sysfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| Error::os("mount /sys read-only", e))?;
    }

    if chrooted {
        setup_root(env)?;
    }

    if !env.resolv_conf.is_empty() {
        let mut text = String::new();
        for line in &env.resolv_conf {
            text.push_str(line);
            text.push('\n');
        }
        std::fs::write("/etc/resolv.conf", text)
            .map_err(|e| Error::from(e).context("write resolv.conf"))?;
    }

    if !env.hostname.is_empty() {
        nix::unistd::sethostname(&env.hostname).map_err(|e| Error::os("sethostname()", e))?;
        if Path::new("/etc/hostname").exists() {
            let _ = std::fs::write("/etc/hostname", format!("{}\n", env.hostname));
        }
    }

    chdir(&env.cwd).map_err(|e| Error::os(format!("chdir({})", env.cwd.display()), e))?;

    if env.new_mount_ns {
        // Sub-containers inherit propagation from here on.
        remount_root_flags(MsFlags::MS_SHARED | MsFlags::MS_REC)?;
    }

    if env.quadro_fork {
        let sock2 = sock2.ok_or_else(|| Error::new(ErrorKind::Unknown, "missing second socket"))?;
        match unsafe { fork() }.map_err(|e| Error::os("fork command", e))? {
            ForkResult::Parent { child } => {
                // Become pid 1 of the namespace; the grandchild is the
                // user command.
                init_helper_caps().apply_limit()?;
                exec_init(env, Some(child))?;
                unreachable!("exec_init returns only through an error");
            }
            ForkResult::Child => {
                sock2.send_pid(nix::unistd::getpid().as_raw())?;
                sock2.recv_wake()?;
                *reported += 1; // The broker forwards the pid upward.
                setsid().map_err(|e| Error::os("setsid()", e))?;
            }
        }
    }

    apply_credentials(env)?;

    env.cap_ambient.apply_ambient()?;
    env.cap_limit.apply_limit()?;
    if !env.cred.is_root() {
        env.cap_ambient.apply_effective()?;
    }

    if let Some(stdio) = &env.stdio {
        for (fd, file) in stdio.iter().enumerate() {
            nix::unistd::dup2(file.as_raw_fd(), fd as i32)
                .map_err(|e| Error::os(format!("dup2 stdio {fd}"), e))?;
        }
    }

    nix::sys::stat::umask(Mode::from_bits_truncate(env.umask));

    Ok(())
}

fn apply_rlimits(env: &TaskEnv) -> Result<()> {
    for (name, (soft, hard)) in &env.rlimits {
        let resource = rlimit_by_name(name)?;
        nix::sys::resource::setrlimit(resource, *soft, *hard)
            .map_err(|e| Error::os(format!("setrlimit({name}, {soft}:{hard})"), e))?;
    }
    Ok(())
}

/// Maps the `ulimit` property resource names onto kernel resources.
pub(crate) fn rlimit_by_name(name: &str) -> Result<nix::sys::resource::Resource> {
    use nix::sys::resource::Resource;
    match name {
        "as" => Ok(Resource::RLIMIT_AS),
        "core" => Ok(Resource::RLIMIT_CORE),
        "cpu" => Ok(Resource::RLIMIT_CPU),
        "data" => Ok(Resource::RLIMIT_DATA),
        "fsize" => Ok(Resource::RLIMIT_FSIZE),
        "memlock" => Ok(Resource::RLIMIT_MEMLOCK),
        "nofile" => Ok(Resource::RLIMIT_NOFILE),
        "nproc" => Ok(Resource::RLIMIT_NPROC),
        "stack" => Ok(Resource::RLIMIT_STACK),
        _ => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("unknown rlimit '{name}'"),
        )),
    }
}

fn remount_root_flags(flags: MsFlags) -> Result<()> {
    mount(None::<&str>, "/", None::<&str>, flags, None::<&str>)
        .map_err(|e| Error::os("remount /", e))
}

fn setup_root(env: &TaskEnv) -> Result<()> {
    let root = &env.root;

    // The root directory becomes a mount point of its own.
    mount(
        Some(root),
        root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::os(format!("bind root {}", root.display()), e))?;

    let dev = root.join("dev");
    std::fs::create_dir_all(&dev).map_err(|e| Error::from(e).context("mkdir /dev"))?;
    mount(
        Some("tmpfs"),
        &dev,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("mode=755,size=65536k"),
    )
    .map_err(|e| Error::os("mount /dev tmpfs", e))?;

    for device in standard_devices().iter().map(Path::new).chain(env.devices.iter().map(PathBuf::as_path)) {
        make_device(root, device)?;
    }

    if env.bind_dns && env.resolv_conf.is_empty() {
        let target = root.join("etc/resolv.conf");
        if target.exists() || {
            std::fs::create_dir_all(root.join("etc")).is_ok()
                && std::fs::write(&target, "").is_ok()
        } {
            mount(
                Some("/etc/resolv.conf"),
                &target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| Error::os("bind resolv.conf", e))?;
        }
    }

    for bind in &env.bind_mounts {
        let target = root.join(bind.target.strip_prefix("/").unwrap_or(&bind.target));
        if bind.source.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| Error::from(e).context("mkdir bind target"))?;
        } else if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::from(e).context("mkdir bind target"))?;
            if !target.exists() {
                std::fs::write(&target, "").map_err(|e| Error::from(e).context("touch bind target"))?;
            }
        }
        mount(
            Some(&bind.source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| Error::os(format!("bind {}", bind.source.display()), e))?;
        if bind.read_only {
            mount(
                None::<&str>,
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| Error::os("remount bind read-only", e))?;
        }
    }

    if env.root_ro {
        mount(
            None::<&str>,
            root,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| Error::os("remount root read-only", e))?;
    }

    if env.new_mount_ns {
        chdir(root).map_err(|e| Error::os("chdir new root", e))?;
        pivot_root(".", ".").map_err(|e| Error::os("pivot_root()", e))?;
        umount2(".", MntFlags::MNT_DETACH).map_err(|e| Error::os("umount old root", e))?;
        chdir("/").map_err(|e| Error::os("chdir /", e))?;
    } else {
        chroot(root).map_err(|e| Error::os("chroot()", e))?;
        chdir("/").map_err(|e| Error::os("chdir /", e))?;
    }
    Ok(())
}

const fn standard_devices() -> [&'static str; 6] {
    [
        "/dev/null",
        "/dev/zero",
        "/dev/full",
        "/dev/random",
        "/dev/urandom",
        "/dev/tty",
    ]
}

fn make_device(root: &Path, device: &Path) -> Result<()> {
    let host = nix::sys::stat::stat(device)
        .map_err(|e| Error::os(format!("stat {}", device.display()), e))?;
    let kind = SFlag::from_bits_truncate(host.st_mode) & (SFlag::S_IFCHR | SFlag::S_IFBLK);
    if kind.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("{} is not a device node", device.display()),
        ));
    }
    let target = root.join(device.strip_prefix("/").unwrap_or(device));
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::from(e).context("mkdir device dir"))?;
    }
    mknod(
        &target,
        kind,
        Mode::from_bits_truncate(host.st_mode & 0o777),
        host.st_rdev,
    )
    .map_err(|e| Error::os(format!("mknod {}", target.display()), e))
}

fn apply_credentials(env: &TaskEnv) -> Result<()> {
    let cred = &env.cred;
    if !cred.is_root() {
        // Keep permitted caps across the uid change so the ambient set
        // can be raised afterwards.
        let rc = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(Error::os("prctl(PR_SET_KEEPCAPS)", nix::errno::Errno::last()));
        }
    }
    let gids: Vec<nix::unistd::Gid> = cred
        .groups
        .iter()
        .map(|gid| nix::unistd::Gid::from_raw(*gid))
        .collect();
    nix::unistd::setgroups(&gids).map_err(|e| Error::os("setgroups()", e))?;
    let gid = nix::unistd::Gid::from_raw(cred.gid);
    nix::unistd::setresgid(gid, gid, gid).map_err(|e| Error::os("setresgid()", e))?;
    let uid = nix::unistd::Uid::from_raw(cred.uid);
    nix::unistd::setresuid(uid, uid, uid).map_err(|e| Error::os("setresuid()", e))?;
    Ok(())
}

fn cstring(text: &str) -> Result<CString> {
    CString::new(text).map_err(|_| Error::new(ErrorKind::InvalidValue, "NUL byte in argument"))
}

fn build_env(env: &TaskEnv) -> Result<Vec<CString>> {
    env.env.iter().map(|entry| cstring(entry)).collect()
}

/// Execs the pid-1 helper; with `wait` it supervises that pid, without it
/// parks as the idle init of a meta namespace.
fn exec_init(env: &TaskEnv, wait: Option<Pid>) -> Result<()> {
    let file = env
        .init
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::Unknown, "init helper not opened"))?;

    let mut args = vec![
        cstring("warren-init")?,
        cstring("--container")?,
        cstring(&env.name)?,
    ];
    if let Some(pid) = wait {
        args.push(cstring("--wait")?);
        args.push(cstring(&pid.as_raw().to_string())?);
    }
    let envp = build_env(env)?;
    nix::unistd::fexecve(file.as_raw_fd(), &args, &envp)
        .map_err(|e| Error::os("fexecve(warren-init)", e))?;
    Ok(())
}

fn exec_command(env: &TaskEnv) -> Result<()> {
    if env.command.is_empty() {
        // Meta with isolation: hold the namespace open as pid 1.
        exec_init(env, None)?;
        return Err(Error::new(ErrorKind::Unknown, "exec_init returned"));
    }

    let argv = split_command(&env.command)?;
    let args: Vec<CString> = argv
        .iter()
        .map(|arg| cstring(arg))
        .collect::<Result<_>>()?;
    let envp = build_env(env)?;
    nix::unistd::execvpe(&args[0], &args, &envp).map_err(|e| {
        Error::errno(
            ErrorKind::InvalidValue,
            e,
            format!("execvpe({})", argv[0]),
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rlimit_names() {
        assert!(rlimit_by_name("nofile").is_ok());
        assert!(rlimit_by_name("memlock").is_ok());
        assert!(rlimit_by_name("frobnicate").is_err());
    }

    #[test]
    fn standard_devices_are_absolute() {
        for device in standard_devices() {
            assert!(device.starts_with("/dev/"));
        }
    }
}
