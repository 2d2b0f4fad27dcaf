//! Wait-for-state waiters.
//!
//! A `Wait` request parks the client until some named container (or any
//! match of a wildcard list) reaches a state it cares about: Dead or
//! Stopped, and for meta containers the moment the last running descendant
//! exits. Each waiter fires at most once and reports the triggering
//! container's name composed into the client's namespace.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;

use crate::container::Container;
use crate::error::Error;
use crate::name::compose_name;

/// What a woken waiter reports back to the client.
#[derive(Debug)]
pub struct WaitResult {
    /// Namespace-relative name of the triggering container; empty on
    /// timeout.
    pub name: String,
    /// Set when the name could not be composed for this client.
    pub error: Option<Error>,
}

/// One parked `Wait` request.
#[derive(Debug)]
pub struct Waiter {
    /// Namespace prefix of the waiting client, for name composition.
    ns: String,
    /// Wildcard patterns; empty for exact-name waiters.
    wildcards: Vec<String>,
    fired: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<WaitResult>>>,
}

impl Waiter {
    /// Creates a waiter and the channel its client should await.
    #[must_use]
    pub fn new(ns: String, wildcards: Vec<String>) -> (Arc<Self>, oneshot::Receiver<WaitResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                ns,
                wildcards,
                fired: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// True for a wildcard waiter.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        !self.wildcards.is_empty()
    }

    /// Wakes the waiter. `None` means the wait timed out.
    ///
    /// Wildcard waiters stay parked unless the composed name matches one
    /// of their patterns. At most one wakeup is ever delivered; later
    /// calls are no-ops.
    pub fn wake(&self, who: Option<&Arc<Container>>) {
        let result = match who {
            None => WaitResult {
                name: String::new(),
                error: None,
            },
            Some(ct) => match compose_name(&ct.name, &self.ns) {
                Ok(name) => {
                    if self.is_wildcard() && !self.matches(&name) {
                        return;
                    }
                    WaitResult { name, error: None }
                }
                Err(err) => {
                    if self.is_wildcard() {
                        return;
                    }
                    WaitResult {
                        name: String::new(),
                        error: Some(err),
                    }
                }
            },
        };

        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.tx.lock().expect("waiter poisoned").take() {
            // The client may have disconnected; nothing to do then.
            let _ = tx.send(result);
        }
    }

    fn matches(&self, name: &str) -> bool {
        self.wildcards.iter().any(|pattern| glob_match(pattern, name))
    }
}

/// The process-global wildcard waiter list.
#[derive(Debug, Default)]
pub struct WildcardWaiters {
    waiters: Mutex<Vec<Weak<Waiter>>>,
}

impl WildcardWaiters {
    /// Registers a wildcard waiter.
    pub fn add(&self, waiter: &Arc<Waiter>) {
        let mut waiters = self.waiters.lock().expect("wildcard waiters poisoned");
        waiters.retain(|w| w.upgrade().is_some());
        waiters.push(Arc::downgrade(waiter));
    }

    /// Offers a state change to every registered wildcard waiter.
    pub fn wake_all(&self, who: &Arc<Container>) {
        let snapshot: Vec<_> = {
            let waiters = self.waiters.lock().expect("wildcard waiters poisoned");
            waiters.iter().filter_map(Weak::upgrade).collect()
        };
        for waiter in snapshot {
            waiter.wake(Some(who));
        }
    }
}

/// Shell-style pattern match: `*` spans any run, `?` one character.
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (None, 0usize);

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(star_pos) = star {
            p = star_pos + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;

    fn container(name: &str) -> Arc<Container> {
        let config = DaemonConfig::default();
        let root = Container::new(None, "/", 0, &config);
        Container::new(Some(&root), name, 1, &config)
    }

    #[test]
    fn glob_basics() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a/*", "a/b"));
        assert!(glob_match("a/*", "a/b/c"));
        assert!(glob_match("job-?", "job-1"));
        assert!(!glob_match("job-?", "job-12"));
        assert!(!glob_match("a/*", "b/c"));
        assert!(glob_match("", ""));
    }

    #[test]
    fn exact_waiter_fires_once() {
        let (waiter, mut rx) = Waiter::new(String::new(), Vec::new());
        let ct = container("a");
        waiter.wake(Some(&ct));
        waiter.wake(Some(&ct));
        let result = rx.try_recv().unwrap();
        assert_eq!(result.name, "a");
        assert!(result.error.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn timeout_delivers_empty_name() {
        let (waiter, mut rx) = Waiter::new(String::new(), Vec::new());
        waiter.wake(None);
        let result = rx.try_recv().unwrap();
        assert!(result.name.is_empty());
        assert!(result.error.is_none());
    }

    #[test]
    fn wildcard_waiter_filters() {
        let (waiter, mut rx) = Waiter::new(String::new(), vec!["job-*".to_string()]);
        let other = container("service");
        waiter.wake(Some(&other));
        assert!(rx.try_recv().is_err());

        let job = container("job-7");
        waiter.wake(Some(&job));
        assert_eq!(rx.try_recv().unwrap().name, "job-7");
    }

    #[test]
    fn composition_error_reported_to_exact_waiter() {
        let (waiter, mut rx) = Waiter::new("ns".to_string(), Vec::new());
        let outside = container("elsewhere");
        waiter.wake(Some(&outside));
        let result = rx.try_recv().unwrap();
        assert!(result.error.is_some());
    }

    #[test]
    fn wildcard_registry_prunes_dead_waiters() {
        let registry = WildcardWaiters::default();
        let (waiter, _rx) = Waiter::new(String::new(), vec!["*".to_string()]);
        registry.add(&waiter);
        drop(waiter);
        let (second, mut rx) = Waiter::new(String::new(), vec!["*".to_string()]);
        registry.add(&second);
        registry.wake_all(&container("a"));
        assert_eq!(rx.try_recv().unwrap().name, "a");
    }
}
