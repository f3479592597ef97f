#![forbid(unsafe_code)]

//! Single-threaded cooperative event loop.
//!
//! The loop owns every UI-facing callback: tasks run one at a time on the
//! thread that called [`EventLoop::run_until`]. Any thread may hand work to
//! the loop through a cloned [`LoopHandle`] without blocking:
//!
//! - [`LoopHandle::post`] queues a task to run as soon as the loop is free
//!   (FIFO with other posted tasks).
//! - [`LoopHandle::post_after`] registers a timed task, dispatched from the
//!   loop thread once its deadline passes (deadline order, ties broken by
//!   registration order).
//!
//! # Panics in tasks
//!
//! A panicking task does not take the loop down. The panic is caught,
//! logged, and kept as a background panic until someone drains it with
//! [`LoopHandle::take_background_panics`]; the harness turns those into
//! test failures after the test body.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::failure::panic_message;

/// A unit of work handed to the loop or the scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum LoopCommand {
    Run(Task),
    /// A timer was registered; recompute the next wakeup.
    Wake,
    Exit,
}

struct TimedTask {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimedTask {}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedTask {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct LoopShared {
    timers: Mutex<BinaryHeap<TimedTask>>,
    next_seq: AtomicU64,
    owner: Mutex<Option<ThreadId>>,
    background_panics: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why [`EventLoop::run_until`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Someone called [`LoopHandle::request_exit`].
    Requested,
    /// The ceiling elapsed without an exit request.
    CeilingReached,
}

/// Cloneable, thread-safe handle for posting work onto an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    sender: mpsc::Sender<LoopCommand>,
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Queue a task to run on the loop thread. Never blocks.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        if self.sender.send(LoopCommand::Run(Box::new(task))).is_err() {
            tracing::debug!("event loop dropped; discarding posted task");
        }
    }

    /// Register a task to run on the loop thread after `delay`.
    pub fn post_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let seq = self.shared.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        lock(&self.shared.timers).push(TimedTask {
            due: Instant::now() + delay,
            seq,
            task: Box::new(task),
        });
        tracing::trace!(seq, delay_ms = delay.as_millis() as u64, "timer registered");
        // The loop may be parked waiting for a later deadline.
        let _ = self.sender.send(LoopCommand::Wake);
    }

    /// Whether the calling thread is the one currently running the loop.
    pub fn is_loop_thread(&self) -> bool {
        *lock(&self.shared.owner) == Some(thread::current().id())
    }

    /// Whether some thread is currently driving the loop.
    pub fn is_running(&self) -> bool {
        lock(&self.shared.owner).is_some()
    }

    /// Make the loop return once the task in progress (if any) finishes.
    pub fn request_exit(&self) {
        let _ = self.sender.send(LoopCommand::Exit);
    }

    /// Number of timed tasks registered but not yet dispatched.
    pub fn pending_timers(&self) -> usize {
        lock(&self.shared.timers).len()
    }

    /// Drop every timed task that has not fired yet. Returns how many.
    pub fn cancel_pending(&self) -> usize {
        let dropped: Vec<TimedTask> = lock(&self.shared.timers).drain().collect();
        let count = dropped.len();
        // Dropped outside the lock: task captures may run arbitrary Drop code.
        drop(dropped);
        if count > 0 {
            tracing::debug!(count, "cancelled pending timers");
        }
        count
    }

    /// Drain panics caught while running tasks.
    pub fn take_background_panics(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.shared.background_panics))
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("pending_timers", &self.pending_timers())
            .finish_non_exhaustive()
    }
}

/// The loop itself. Not `Clone`: exactly one thread drives it.
pub struct EventLoop {
    receiver: mpsc::Receiver<LoopCommand>,
    handle: LoopHandle,
}

impl EventLoop {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(LoopShared {
            timers: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            owner: Mutex::new(None),
            background_panics: Mutex::new(Vec::new()),
        });
        Self {
            receiver,
            handle: LoopHandle { sender, shared },
        }
    }

    /// A handle for posting onto this loop.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Run tasks on the current thread until an exit is requested or
    /// `ceiling` elapses.
    pub fn run_until(&mut self, ceiling: Duration) -> LoopExit {
        let shared = Arc::clone(&self.handle.shared);
        *lock(&shared.owner) = Some(thread::current().id());
        let deadline = Instant::now() + ceiling;
        tracing::debug!(ceiling_ms = ceiling.as_millis() as u64, "event loop running");

        let exit = loop {
            self.run_due_timers();

            let now = Instant::now();
            if now >= deadline {
                break LoopExit::CeilingReached;
            }
            let next_due = lock(&shared.timers).peek().map(|t| t.due);
            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));

            match self
                .receiver
                .recv_timeout(wake_at.saturating_duration_since(now))
            {
                Ok(LoopCommand::Run(task)) => self.run_task(task),
                Ok(LoopCommand::Wake) | Err(mpsc::RecvTimeoutError::Timeout) => {}
                Ok(LoopCommand::Exit) => break LoopExit::Requested,
                // Unreachable while `self.handle` holds a sender.
                Err(mpsc::RecvTimeoutError::Disconnected) => break LoopExit::Requested,
            }
        };

        *lock(&shared.owner) = None;
        tracing::debug!(?exit, pending_timers = self.handle.pending_timers(), "event loop stopped");
        exit
    }

    /// Run everything that is ready right now without blocking. Returns the
    /// number of tasks executed. Exit requests are consumed and ignored.
    pub fn run_ready(&mut self) -> usize {
        let shared = Arc::clone(&self.handle.shared);
        *lock(&shared.owner) = Some(thread::current().id());
        let mut executed = self.run_due_timers();
        while let Ok(command) = self.receiver.try_recv() {
            if let LoopCommand::Run(task) = command {
                self.run_task(task);
                executed += 1;
            }
            executed += self.run_due_timers();
        }
        *lock(&shared.owner) = None;
        executed
    }

    fn run_due_timers(&mut self) -> usize {
        let mut executed = 0;
        loop {
            let due = {
                let mut timers = lock(&self.handle.shared.timers);
                match timers.peek() {
                    Some(next) if next.due <= Instant::now() => timers.pop(),
                    _ => None,
                }
            };
            match due {
                Some(timed) => {
                    tracing::trace!(seq = timed.seq, "timer fired");
                    self.run_task(timed.task);
                    executed += 1;
                }
                None => return executed,
            }
        }
    }

    fn run_task(&self, task: Task) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
            let message = panic_message(payload.as_ref());
            tracing::warn!(%message, "task panicked on the event loop");
            lock(&self.handle.shared.background_panics).push(message);
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Task) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |n: u32| -> Task {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().unwrap().push(n))
        };
        (log, make)
    }

    #[test]
    fn posted_tasks_run_in_fifo_order() {
        let mut ev = EventLoop::new();
        let handle = ev.handle();
        let (log, make) = recorder();
        for n in 0..5 {
            handle.post(make(n));
        }
        handle.request_exit();

        assert_eq!(ev.run_until(Duration::from_secs(5)), LoopExit::Requested);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn timed_tasks_run_by_deadline() {
        let mut ev = EventLoop::new();
        let handle = ev.handle();
        let (log, make) = recorder();
        handle.post_after(Duration::from_millis(30), make(3));
        handle.post_after(Duration::from_millis(10), make(1));
        handle.post_after(Duration::from_millis(20), make(2));
        let exit = handle.clone();
        handle.post_after(Duration::from_millis(40), move || exit.request_exit());

        assert_eq!(ev.run_until(Duration::from_secs(5)), LoopExit::Requested);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(handle.pending_timers(), 0);
    }

    #[test]
    fn timer_does_not_fire_early() {
        let mut ev = EventLoop::new();
        let handle = ev.handle();
        let fired_at = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&fired_at);
        let exit = handle.clone();
        let start = Instant::now();
        handle.post_after(Duration::from_millis(50), move || {
            *slot.lock().unwrap() = Some(start.elapsed());
            exit.request_exit();
        });

        ev.run_until(Duration::from_secs(5));
        let elapsed = fired_at.lock().unwrap().unwrap();
        assert!(elapsed >= Duration::from_millis(50), "fired after {elapsed:?}");
    }

    #[test]
    fn ceiling_stops_an_idle_loop() {
        let mut ev = EventLoop::new();
        let start = Instant::now();
        assert_eq!(
            ev.run_until(Duration::from_millis(30)),
            LoopExit::CeilingReached
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn cross_thread_post_runs_on_loop_thread() {
        let mut ev = EventLoop::new();
        let handle = ev.handle();
        let loop_thread = thread::current().id();
        let observed = Arc::new(Mutex::new(None));

        let poster = handle.clone();
        let slot = Arc::clone(&observed);
        let worker = thread::spawn(move || {
            assert!(!poster.is_loop_thread());
            let inner = poster.clone();
            poster.post(move || {
                *slot.lock().unwrap() = Some((thread::current().id(), inner.is_loop_thread()));
                inner.request_exit();
            });
        });

        ev.run_until(Duration::from_secs(5));
        worker.join().unwrap();
        assert_eq!(*observed.lock().unwrap(), Some((loop_thread, true)));
        assert!(!handle.is_loop_thread(), "ownership is released after run");
    }

    #[test]
    fn panicking_task_is_recorded_and_loop_survives() {
        let mut ev = EventLoop::new();
        let handle = ev.handle();
        let (log, make) = recorder();
        handle.post(|| panic!("widget exploded"));
        handle.post(make(7));
        handle.request_exit();

        ev.run_until(Duration::from_secs(5));
        assert_eq!(*log.lock().unwrap(), vec![7]);
        let panics = handle.take_background_panics();
        assert_eq!(panics, vec!["widget exploded".to_string()]);
        assert!(handle.take_background_panics().is_empty());
    }

    #[test]
    fn cancel_pending_drops_unfired_timers() {
        let mut ev = EventLoop::new();
        let handle = ev.handle();
        let (log, make) = recorder();
        handle.post_after(Duration::from_millis(20), make(1));
        handle.post_after(Duration::from_secs(60), make(2));
        assert_eq!(handle.pending_timers(), 2);

        assert_eq!(handle.cancel_pending(), 2);
        assert_eq!(handle.pending_timers(), 0);
        assert_eq!(ev.run_until(Duration::from_millis(40)), LoopExit::CeilingReached);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn run_ready_drains_without_blocking() {
        let mut ev = EventLoop::new();
        let handle = ev.handle();
        let (log, make) = recorder();
        handle.post(make(1));
        handle.post_after(Duration::ZERO, make(2));
        handle.post_after(Duration::from_secs(60), make(3));

        assert_eq!(ev.run_ready(), 2);
        let mut seen = log.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(handle.pending_timers(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn timers_fire_in_delay_then_registration_order(
            slots in proptest::collection::vec(0u64..4, 1..8)
        ) {
            let mut ev = EventLoop::new();
            let handle = ev.handle();
            let (log, make) = recorder();
            for (i, slot) in slots.iter().enumerate() {
                handle.post_after(Duration::from_millis(slot * 5), make(i as u32));
            }
            let exit = handle.clone();
            handle.post_after(Duration::from_millis(40), move || exit.request_exit());
            ev.run_until(Duration::from_secs(5));

            let mut expected: Vec<u32> = (0..slots.len() as u32).collect();
            expected.sort_by_key(|&i| slots[i as usize]);
            prop_assert_eq!(log.lock().unwrap().clone(), expected);
        }
    }
}
