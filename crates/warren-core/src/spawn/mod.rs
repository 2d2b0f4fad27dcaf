//! The spawn protocol.
//!
//! Starting an isolated task means entering foreign namespaces and joining
//! foreign cgroups in a strict order, while the daemon keeps a pid it can
//! wait on. A plain fork cannot deliver both, so the construction runs in
//! stages over a socketpair:
//!
//! 1. the daemon forks a *broker*, which joins the target cgroups, opens
//!    the host-side stdio, enters the parent container's namespaces and
//!    creates the new ones;
//! 2. the broker forks the *task* and reports its pid up (the wait pid,
//!    then the in-namespace pid);
//! 3. the task runs the configuration sequence (rlimits, mounts, root,
//!    credentials, capabilities, stdio) and parks at a wakeup barrier;
//! 4. app-mode isolated containers fork once more: the grandchild becomes
//!    the user command while the task execs `warren-init` as pid 1 of the
//!    new namespace.
//!
//! Until the daemon sends the final wakeup no user code has run, so a
//! failed start is killed off through the freezer cgroup without side
//! effects. The daemon process is a child subreaper; brokers exit and
//! their orphans reparent to the daemon, where the SIGCHLD reaper
//! collects them.

pub mod socket;

mod child;

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{info, warn};

use crate::caps::CapSet;
use crate::cgroup::Cgroup;
use crate::container::{BindMount, VirtMode};
use crate::cred::Cred;
use crate::error::{Error, ErrorKind, Result};
use crate::spawn::socket::SpawnSocket;

/// Everything the broker and task need, assembled under the container's
/// write lock before the first fork.
#[derive(Debug)]
pub struct TaskEnv {
    /// Container name, for logs and the pid-1 helper.
    pub name: String,
    /// Command line; empty for meta containers (pid-1 helper only).
    pub command: String,
    /// Environment entries, `KEY=VALUE`.
    pub env: Vec<String>,
    /// Working directory inside the root.
    pub cwd: PathBuf,
    /// Host-side root directory; `/` to share the parent's.
    pub root: PathBuf,
    /// Remount the root read-only.
    pub root_ro: bool,
    /// Fresh pid/ipc (and uts) namespaces.
    pub isolate: bool,
    /// App or os semantics.
    pub virt_mode: VirtMode,
    /// A fresh mount namespace is needed.
    pub new_mount_ns: bool,
    /// Create a fresh empty network namespace.
    pub new_net_ns: bool,
    /// Hostname to set in the new uts namespace.
    pub hostname: String,
    /// Literal resolv.conf content; empty leaves it alone.
    pub resolv_conf: Vec<String>,
    /// Bind the host resolv.conf into the chroot.
    pub bind_dns: bool,
    /// Bind mounts applied inside the root.
    pub bind_mounts: Vec<BindMount>,
    /// Rlimits by resource name.
    pub rlimits: HashMap<String, (u64, u64)>,
    /// Umask applied before exec.
    pub umask: u32,
    /// Identity the command runs as.
    pub cred: Cred,
    /// Bounding/permitted upper limit.
    pub cap_limit: CapSet,
    /// Ambient set raised before exec.
    pub cap_ambient: CapSet,
    /// Host device nodes replicated into the chroot.
    pub devices: Vec<PathBuf>,
    /// Cgroups the broker joins before forking the task.
    pub cgroups: Vec<Cgroup>,
    /// Task pid of the running parent container, if any.
    pub parent_task_pid: Option<i32>,
    /// The parent's pid namespace differs from the daemon's, so an extra
    /// broker hop is needed for the nested pid namespace.
    pub triple_fork: bool,
    /// App-mode isolated non-meta: fork the user command under a pid-1
    /// helper.
    pub quadro_fork: bool,
    /// Opened stdio files, host view: stdin, stdout, stderr.
    pub stdio: Option<[File; 3]>,
    /// The `warren-init` helper binary, opened before any chroot so it
    /// can be `fexecve`d from inside one.
    pub init: Option<File>,
    /// Abort the handshake after this long.
    pub start_timeout: Duration,
}

/// Pids learned from a successful spawn.
#[derive(Debug, Clone, Copy)]
pub struct StartedTask {
    /// Pid the daemon waits on, host namespace.
    pub wait_pid: i32,
    /// User command pid, host namespace.
    pub task_pid: i32,
    /// User command pid inside its namespace.
    pub task_vpid: i32,
}

impl TaskEnv {
    /// Runs the whole protocol. Blocking; call from a blocking-ok thread.
    ///
    /// On any failure every cgroup is swept with SIGKILL so no
    /// half-constructed task survives.
    ///
    /// # Errors
    ///
    /// The first stage error, from either side of the socketpair.
    pub fn start(mut self) -> Result<StartedTask> {
        let (master, sock) = SpawnSocket::pair()?;

        let broker_pid = match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => child,
            Ok(ForkResult::Child) => {
                // Never returns.
                child::broker_main(&mut self, &sock, &master);
            }
            Err(errno) => {
                return Err(Error::os("fork broker", errno));
            }
        };
        drop(sock);
        drop(self.stdio.take());
        drop(self.init.take());

        match self.handshake(&master, broker_pid) {
            Ok(started) => {
                info!(
                    name = %self.name,
                    wait_pid = started.wait_pid,
                    task_pid = started.task_pid,
                    task_vpid = started.task_vpid,
                    "task started"
                );
                Ok(started)
            }
            Err(err) => {
                warn!(name = %self.name, %err, "killing partially constructed container");
                for cg in &self.cgroups {
                    let _ = cg.kill_all(Signal::SIGKILL);
                }
                let _ = nix::sys::signal::kill(broker_pid, Signal::SIGKILL);
                let _ = waitpid(broker_pid, None);
                Err(err)
            }
        }
    }

    fn handshake(&self, master: &SpawnSocket, broker_pid: Pid) -> Result<StartedTask> {
        master.set_recv_timeout(self.start_timeout)?;

        let (wait_pid, _) = master.recv_pid()?;
        let (task_pid, task_vpid) = master.recv_pid()?;

        // The broker exits once the construction stands; a non-zero
        // status means it died before reporting an error frame. The
        // daemon-wide SIGCHLD reaper may collect it first, in which case
        // only the socket tells the story.
        let broker_clean = match waitpid(broker_pid, None) {
            Ok(status) => matches!(status, WaitStatus::Exited(_, 0)),
            Err(nix::errno::Errno::ECHILD) => true,
            Err(errno) => return Err(Error::os("wait for broker", errno)),
        };

        // The task is parked before exec; this is the last moment the
        // start can be abandoned without user code having run. A failed
        // wakeup means the task is already gone; its error frame is
        // still in the socket buffer and beats this failure in detail.
        if let Err(err) = master.send_wake() {
            warn!(name = %self.name, %err, "task wakeup failed");
        }

        if let Some(err) = master.recv_error()? {
            return Err(err);
        }
        if !broker_clean {
            return Err(Error::new(
                ErrorKind::Unknown,
                "spawn broker died before finishing the construction",
            ));
        }

        Ok(StartedTask {
            wait_pid,
            task_pid,
            task_vpid,
        })
    }
}

/// Splits a command line into argv.
///
/// Handles single and double quotes and backslash escapes. Shell
/// metacharacters are rejected: there is no shell between the daemon and
/// the command.
///
/// # Errors
///
/// `InvalidValue` for empty commands, unbalanced quotes and
/// metacharacters.
pub fn split_command(command: &str) -> Result<Vec<String>> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut has_token = false;
    let mut chars = command.chars();

    while let Some(ch) = chars.next() {
        match ch {
            ' ' | '\t' => {
                if has_token {
                    argv.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            '\'' => {
                has_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(Error::new(
                                ErrorKind::InvalidValue,
                                "unbalanced single quote in command",
                            ))
                        }
                    }
                }
            }
            '"' => {
                has_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(esc) => current.push(esc),
                            None => {
                                return Err(Error::new(
                                    ErrorKind::InvalidValue,
                                    "dangling backslash in command",
                                ))
                            }
                        },
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(Error::new(
                                ErrorKind::InvalidValue,
                                "unbalanced double quote in command",
                            ))
                        }
                    }
                }
            }
            '\\' => {
                has_token = true;
                match chars.next() {
                    Some(esc) => current.push(esc),
                    None => {
                        return Err(Error::new(
                            ErrorKind::InvalidValue,
                            "dangling backslash in command",
                        ))
                    }
                }
            }
            '|' | '&' | ';' | '<' | '>' | '(' | ')' | '{' | '}' | '\n' => {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("shell operator '{ch}' is not supported in command"),
                ));
            }
            _ => {
                has_token = true;
                current.push(ch);
            }
        }
    }
    if has_token {
        argv.push(current);
    }
    if argv.is_empty() {
        return Err(Error::new(ErrorKind::InvalidValue, "empty command"));
    }
    Ok(argv)
}

/// Validates a `ulimit` property resource name.
///
/// # Errors
///
/// `InvalidValue` for names with no matching kernel resource.
pub fn rlimit_name_valid(name: &str) -> Result<()> {
    child::rlimit_by_name(name).map(|_| ())
}

/// True when `pid` lives in the caller's pid namespace.
#[must_use]
pub fn same_pid_ns(pid: i32) -> bool {
    let ns_inode = |path: &str| std::fs::metadata(path).ok().map(|m| {
        use std::os::unix::fs::MetadataExt;
        m.ino()
    });
    match (
        ns_inode("/proc/self/ns/pid"),
        ns_inode(&format!("/proc/{pid}/ns/pid")),
    ) {
        (Some(own), Some(other)) => own == other,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_plain_words() {
        assert_eq!(
            split_command("/bin/sleep 10").unwrap(),
            vec!["/bin/sleep", "10"]
        );
    }

    #[test]
    fn split_quotes() {
        assert_eq!(
            split_command(r#"echo 'hello world' "two  spaces""#).unwrap(),
            vec!["echo", "hello world", "two  spaces"]
        );
        assert_eq!(
            split_command(r#"printf "a\"b""#).unwrap(),
            vec!["printf", "a\"b"]
        );
    }

    #[test]
    fn split_rejects_operators() {
        for bad in ["a | b", "a && b", "a > /tmp/x", "a; b"] {
            assert!(split_command(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn split_rejects_unbalanced() {
        assert!(split_command("echo 'oops").is_err());
        assert!(split_command("echo \"oops").is_err());
        assert!(split_command("echo oops\\").is_err());
        assert!(split_command("   ").is_err());
    }

    #[test]
    fn own_pid_is_in_own_ns() {
        assert!(same_pid_ns(std::process::id() as i32));
    }
}
