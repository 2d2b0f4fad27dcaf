//! `warren-init`: the pid-1 helper.
//!
//! Two jobs, depending on the arguments:
//!
//! - `--wait <pid>`: supervise the payload process, reap everything
//!   that reparents here, and exit with the payload's status. A payload
//!   killed by a signal is encoded as `128 + signum` (pid 1 cannot be
//!   killed by the signal itself, so the daemon decodes the status on
//!   its side).
//! - without `--wait`: park as the idle init of a meta namespace,
//!   reaping orphans until told to die.
//!
//! SIGTERM and SIGINT are forwarded to the payload so a container stop
//! reaches the real process.

use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

static PAYLOAD_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_signal(sig: libc::c_int) {
    let pid = PAYLOAD_PID.load(Ordering::Relaxed);
    if pid > 0 {
        // Async-signal-safe: plain kill only.
        unsafe { libc::kill(pid, sig) };
    }
}

fn install_forwarders() {
    let handler = SigHandler::Handler(forward_signal);
    for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT] {
        // Installing a handler for pid 1 also makes the signal
        // deliverable at all.
        let _ = unsafe { signal::signal(sig, handler) };
    }
}

fn parse_args() -> (Option<String>, Option<i32>) {
    let mut container = None;
    let mut wait = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--container" => container = args.next(),
            "--wait" => wait = args.next().and_then(|v| v.parse().ok()),
            _ => {}
        }
    }
    (container, wait)
}

fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    }
}

fn main() {
    let (_container, wait) = parse_args();
    install_forwarders();

    if let Some(pid) = wait {
        PAYLOAD_PID.store(pid, Ordering::Relaxed);
        let payload = Pid::from_raw(pid);
        loop {
            match waitpid(None, None) {
                Ok(status) if status.pid() == Some(payload) => {
                    std::process::exit(exit_code(status));
                }
                Ok(_) => {
                    // Reparented orphan; reap and carry on.
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(nix::errno::Errno::ECHILD) => {
                    // The payload is not ours to wait on and is gone.
                    std::process::exit(0);
                }
                Err(_) => std::process::exit(1),
            }
        }
    }

    // Meta namespace init: reap orphans forever.
    loop {
        match waitpid(None, None) {
            Ok(_) | Err(nix::errno::Errno::EINTR) => {}
            Err(_) => {
                std::thread::sleep(std::time::Duration::from_secs(3600));
            }
        }
    }
}
