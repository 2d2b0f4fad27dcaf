//! Delayed-event queue.
//!
//! A priority queue keyed by due time feeds the engine's background work:
//! child exits, OOM notifications, respawn timers, wait timeouts, weak
//! destruction and the periodic rotation tick. Worker tasks sleep until
//! the top entry is due and dispatch everything that has matured.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::debug;

use crate::container::Container;
use crate::waiter::Waiter;

/// A queued unit of background work.
#[derive(Debug, Clone)]
pub enum Event {
    /// A waited child exited with the given raw wait status.
    Exit {
        /// Host pid that exited.
        pid: i32,
        /// Raw `waitpid` status.
        status: i32,
    },
    /// The memcg OOM eventfd of a container fired.
    Oom {
        /// Target container.
        ct: Weak<Container>,
    },
    /// Re-check and perform a respawn.
    Respawn {
        /// Target container.
        ct: Weak<Container>,
    },
    /// A wait deadline elapsed; wake the waiter with no container.
    WaitTimeout {
        /// The waiter to wake.
        waiter: Weak<Waiter>,
    },
    /// Destroy a weak container whose holding client disconnected.
    DestroyWeak {
        /// Target container.
        ct: Weak<Container>,
    },
    /// Periodic tick: rotate stdio logs, destroy aged Dead containers.
    RotateLogs,
}

impl Event {
    /// Short description for the action log.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Exit { pid, status } => format!("exit status {status} for pid {pid}"),
            Self::Oom { ct } => format!("oom in {}", name_of(ct)),
            Self::Respawn { ct } => format!("respawn {}", name_of(ct)),
            Self::WaitTimeout { .. } => "wait timeout".to_string(),
            Self::DestroyWeak { ct } => format!("destroy weak {}", name_of(ct)),
            Self::RotateLogs => "rotate logs".to_string(),
        }
    }
}

fn name_of(ct: &Weak<Container>) -> String {
    ct.upgrade()
        .map_or_else(|| "<gone>".to_string(), |ct| ct.name.clone())
}

struct Scheduled {
    due: Instant,
    seq: u64,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest due time wins,
        // with insertion order as the tie-break.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The queue itself. Cheap to share behind an `Arc`.
pub struct EventQueue {
    heap: Mutex<BinaryHeap<Scheduled>>,
    notify: Notify,
    seq: AtomicU64,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Schedules `event` to fire `delay` from now.
    pub fn schedule(&self, delay: Duration, event: Event) {
        debug!(delay_ms = delay.as_millis() as u64, event = %event.describe(), "schedule event");
        let scheduled = Scheduled {
            due: Instant::now() + delay,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            event,
        };
        self.heap.lock().expect("event queue poisoned").push(scheduled);
        self.notify.notify_one();
    }

    /// Number of pending events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.lock().expect("event queue poisoned").len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for and returns the next due event.
    ///
    /// Safe to call from several worker tasks; each event is delivered to
    /// exactly one of them.
    pub async fn next(&self) -> Event {
        loop {
            let wait_for = {
                let mut heap = self.heap.lock().expect("event queue poisoned");
                match heap.peek() {
                    Some(top) => {
                        let now = Instant::now();
                        if top.due <= now {
                            let event = heap.pop().map(|s| s.event);
                            drop(heap);
                            if let Some(event) = event {
                                return event;
                            }
                            continue;
                        }
                        Some(top.due - now)
                    }
                    None => None,
                }
            };

            match wait_for {
                Some(timeout) => {
                    tokio::select! {
                        () = tokio::time::sleep(timeout) => {}
                        () = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Non-blocking pop of a due event, for tests and shutdown draining.
    #[must_use]
    pub fn pop_due(&self) -> Option<Event> {
        let mut heap = self.heap.lock().expect("event queue poisoned");
        if heap.peek().is_some_and(|top| top.due <= Instant::now()) {
            heap.pop().map(|s| s.event)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn delivers_in_due_order() {
        let queue = EventQueue::new();
        queue.schedule(
            Duration::from_millis(50),
            Event::Exit { pid: 2, status: 0 },
        );
        queue.schedule(Duration::from_millis(10), Event::Exit { pid: 1, status: 0 });
        queue.schedule(Duration::from_millis(90), Event::RotateLogs);

        let first = queue.next().await;
        assert!(matches!(first, Event::Exit { pid: 1, .. }));
        let second = queue.next().await;
        assert!(matches!(second, Event::Exit { pid: 2, .. }));
        let third = queue.next().await;
        assert!(matches!(third, Event::RotateLogs));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn same_due_time_keeps_insertion_order() {
        let queue = EventQueue::new();
        queue.schedule(Duration::ZERO, Event::Exit { pid: 1, status: 0 });
        queue.schedule(Duration::ZERO, Event::Exit { pid: 2, status: 0 });
        assert!(matches!(queue.next().await, Event::Exit { pid: 1, .. }));
        assert!(matches!(queue.next().await, Event::Exit { pid: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_on_earlier_insert() {
        let queue = std::sync::Arc::new(EventQueue::new());
        queue.schedule(Duration::from_secs(60), Event::RotateLogs);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.schedule(Duration::ZERO, Event::Exit { pid: 7, status: 0 });

        let event = waiter.await.unwrap();
        assert!(matches!(event, Event::Exit { pid: 7, .. }));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn pop_due_only_returns_matured() {
        let queue = EventQueue::new();
        assert!(queue.pop_due().is_none());
        queue.schedule(Duration::from_secs(60), Event::RotateLogs);
        assert!(queue.pop_due().is_none());
        queue.schedule(Duration::ZERO, Event::Exit { pid: 1, status: 0 });
        assert!(matches!(queue.pop_due(), Some(Event::Exit { .. })));
    }
}
