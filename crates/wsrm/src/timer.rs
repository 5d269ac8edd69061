// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One-shot timer service.
//!
//! A single background thread runs deferred acknowledgements, immediate-ack
//! fallbacks and inactivity checks for every sequence of a manager.
//!
//! # Architecture
//! - Deadline-ordered min-heap of `(deadline, task id)`
//! - Task bodies kept in a map so cancellation is a map removal
//! - Condvar wakes the thread when an earlier deadline is scheduled
//!
//! Cancelled tasks leave a stale heap entry behind; it is discarded when it
//! reaches the top.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct TimerState {
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Task>,
    next_id: u64,
    shutdown: bool,
}

#[derive(Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    condvar: Condvar,
}

/// Shared schedule-once timer facility.
pub struct TimerService {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl TimerService {
    /// Start the timer thread.
    pub fn new() -> std::io::Result<Self> {
        let shared = Arc::new(TimerShared::default());
        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("wsrm-timer".into())
            .spawn(move || run(&worker))?;
        Ok(Self {
            shared,
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Run `task` once after `delay`.
    ///
    /// After [`shutdown`](Self::shutdown) the task is dropped and the returned
    /// handle is already inert.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        if state.shutdown {
            log::debug!("[timer] task {} dropped, service is shut down", id);
        } else {
            let wake = state
                .queue
                .peek()
                .map_or(true, |Reverse((first, _))| deadline < *first);
            state.queue.push(Reverse((deadline, id)));
            state.tasks.insert(id, Box::new(task));
            if wake {
                self.shared.condvar.notify_one();
            }
        }

        TimerHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of tasks scheduled and not yet run or cancelled.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Drop every pending task and stop the thread.
    ///
    /// Idempotent. When called from a timer task the thread is not joined; it
    /// exits after the current task returns.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.queue.clear();
            std::mem::take(&mut state.tasks)
        };
        self.shared.condvar.notify_all();
        if !dropped.is_empty() {
            log::debug!("[timer] shutdown dropped {} pending tasks", dropped.len());
        }
        drop(dropped);

        if std::thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                log::error!("[timer] timer thread panicked");
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("pending", &self.pending())
            .finish()
    }
}

fn run(shared: &TimerShared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let Some(&Reverse((deadline, id))) = state.queue.peek() else {
            shared.condvar.wait(&mut state);
            continue;
        };
        if deadline > Instant::now() {
            shared.condvar.wait_until(&mut state, deadline);
            continue;
        }
        state.queue.pop();
        if let Some(task) = state.tasks.remove(&id) {
            MutexGuard::unlocked(&mut state, || run_task(id, task));
        }
    }
}

fn run_task(id: u64, task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        log::error!("[timer] task {} panicked", id);
    }
}

/// Cancellation handle for one scheduled task.
///
/// Cancelling twice, or after the task already ran, is a no-op.
pub struct TimerHandle {
    id: u64,
    shared: Weak<TimerShared>,
}

impl TimerHandle {
    /// Returns `true` only if this call prevented the task from running.
    pub fn cancel(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.state.lock().tasks.remove(&self.id).is_some(),
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.state.lock().tasks.contains_key(&self.id))
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_runs_in_deadline_order() {
        let timer = TimerService::new().unwrap();
        let (tx, rx) = mpsc::channel();

        for (delay, tag) in [(30u64, 3), (10, 1), (20, 2)] {
            let tx = tx.clone();
            timer.schedule(Duration::from_millis(delay), move || {
                let _ = tx.send(tag);
            });
        }

        let order: Vec<i32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let timer = TimerService::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let handle = timer.schedule(Duration::from_millis(50), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.is_pending());
        assert!(handle.cancel());
        assert!(!handle.cancel());
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let timer = TimerService::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let handle = timer.schedule(Duration::from_millis(1), move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!handle.is_pending());
        assert!(!handle.cancel());
    }

    #[test]
    fn test_panicking_task_does_not_stop_service() {
        let timer = TimerService::new().unwrap();
        timer.schedule(Duration::ZERO, || panic!("boom"));
        let (tx, rx) = mpsc::channel();
        timer.schedule(Duration::from_millis(5), move || {
            let _ = tx.send(());
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_shutdown_drops_pending() {
        let timer = TimerService::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let handle = timer.schedule(Duration::from_millis(20), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        timer.shutdown();
        timer.shutdown();
        assert!(timer.is_shutdown());
        assert!(!handle.cancel());

        let late = timer.schedule(Duration::ZERO, || {});
        assert!(!late.is_pending());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_task_can_reschedule_itself() {
        let timer = Arc::new(TimerService::new().unwrap());
        let (tx, rx) = mpsc::channel();
        let t = Arc::clone(&timer);
        timer.schedule(Duration::from_millis(1), move || {
            t.schedule(Duration::from_millis(1), move || {
                let _ = tx.send(());
            });
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        timer.shutdown();
    }
}
