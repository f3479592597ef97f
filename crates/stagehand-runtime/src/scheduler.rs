#![forbid(unsafe_code)]

//! Timer/scheduler: run a callback after a delay in one of two contexts.
//!
//! | Context | `delay > 0` | `delay == 0` |
//! |---------|-------------|--------------|
//! | Blocking | caller sleeps, then runs the task inline | runs inline, no yield |
//! | Cooperative | timed task on the loop | inline on the loop thread, posted otherwise |
//!
//! # Blocking drain
//!
//! A blocking task that schedules another task does not recurse: the new
//! task is queued on the thread and the outermost `schedule_after` runs the
//! queue in order, sleeping before each task. A poll session that re-checks
//! every millisecond for minutes therefore uses constant stack, and the
//! outermost call still returns only once everything it started resolved.
//!
//! Once quitting is set, new tasks are dropped (neither queued nor run),
//! and queued blocking tasks are dropped before their sleep. A sleep that
//! already started still runs its task afterwards, so callbacks that touch
//! shared state re-check [`Scheduler::is_quitting`] themselves.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use crate::event_loop::LoopHandle;
use crate::quit::QuitSignal;

type Task = Box<dyn FnOnce() + Send>;

struct Queued {
    quit: QuitSignal,
    delay: Duration,
    task: Task,
}

thread_local! {
    /// Blocking tasks scheduled while another blocking task runs.
    /// `Some` while a drain is in progress on this thread.
    static PENDING: RefCell<Option<VecDeque<Queued>>> = const { RefCell::new(None) };
}

/// Ends the drain on this thread, also when a task unwinds.
struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let dropped = PENDING.with(|pending| pending.borrow_mut().take().map_or(0, |q| q.len()));
        if dropped > 0 {
            tracing::debug!(dropped, "blocking drain ended with queued tasks");
        }
    }
}

/// Where scheduled tasks execute.
#[derive(Clone, Debug)]
pub enum ExecutionContext {
    /// Serialized on the calling thread.
    Blocking,
    /// On a cooperative event loop.
    Cooperative(LoopHandle),
}

/// Delay-based task scheduler gated by the harness quitting flag.
///
/// Cheap to clone; clones share the quitting flag and loop.
#[derive(Clone, Debug)]
pub struct Scheduler {
    quit: QuitSignal,
    context: ExecutionContext,
}

impl Scheduler {
    /// Scheduler that sleeps on the calling thread.
    #[must_use]
    pub fn blocking(quit: QuitSignal) -> Self {
        Self {
            quit,
            context: ExecutionContext::Blocking,
        }
    }

    /// Scheduler that dispatches onto a cooperative loop.
    #[must_use]
    pub fn cooperative(quit: QuitSignal, handle: LoopHandle) -> Self {
        Self {
            quit,
            context: ExecutionContext::Cooperative(handle),
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// The loop handle in cooperative mode.
    pub fn loop_handle(&self) -> Option<&LoopHandle> {
        match &self.context {
            ExecutionContext::Cooperative(handle) => Some(handle),
            ExecutionContext::Blocking => None,
        }
    }

    pub fn quit_signal(&self) -> &QuitSignal {
        &self.quit
    }

    #[inline]
    pub fn is_quitting(&self) -> bool {
        self.quit.is_quitting()
    }

    /// Run `task` after `delay`.
    ///
    /// Returns `false` when the harness is quitting and the task was dropped.
    pub fn schedule_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> bool {
        if self.quit.is_quitting() {
            tracing::trace!(delay_ms = delay.as_millis() as u64, "quitting; task dropped");
            return false;
        }
        match &self.context {
            ExecutionContext::Blocking => self.run_blocking(delay, Box::new(task)),
            ExecutionContext::Cooperative(handle) => {
                if !delay.is_zero() {
                    handle.post_after(delay, task);
                } else if handle.is_loop_thread() {
                    task();
                } else {
                    handle.post(task);
                }
            }
        }
        true
    }

    fn run_blocking(&self, delay: Duration, task: Task) {
        let first = Queued {
            quit: self.quit.clone(),
            delay,
            task,
        };
        let first = PENDING.with(|pending| {
            let mut pending = pending.borrow_mut();
            match pending.as_mut() {
                Some(queue) => {
                    queue.push_back(first);
                    None
                }
                None => {
                    *pending = Some(VecDeque::new());
                    Some(first)
                }
            }
        });
        let Some(first) = first else {
            return;
        };

        let _drain = DrainGuard;
        let mut next = Some(first);
        while let Some(Queued { quit, delay, task }) = next.take() {
            if quit.is_quitting() {
                tracing::trace!(delay_ms = delay.as_millis() as u64, "quitting; queued task dropped");
            } else {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                task();
            }
            next = PENDING.with(|pending| pending.borrow_mut().as_mut().and_then(VecDeque::pop_front));
        }
    }

    /// Stop all future work: set quitting and drop timers not yet fired.
    ///
    /// Returns the number of timed tasks dropped (always 0 in blocking mode).
    pub fn cancel_all_pending(&self) -> usize {
        self.quit.quit();
        match &self.context {
            ExecutionContext::Cooperative(handle) => handle.cancel_pending(),
            ExecutionContext::Blocking => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{EventLoop, LoopExit};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[test]
    fn blocking_zero_delay_runs_inline() {
        let scheduler = Scheduler::blocking(QuitSignal::new());
        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&ran_on);

        assert!(scheduler.schedule_after(Duration::ZERO, move || {
            *slot.lock().unwrap() = Some(thread::current().id());
        }));
        assert_eq!(*ran_on.lock().unwrap(), Some(caller));
    }

    #[test]
    fn blocking_delay_sleeps_first() {
        let scheduler = Scheduler::blocking(QuitSignal::new());
        let start = Instant::now();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        scheduler.schedule_after(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocking_nested_tasks_run_after_their_parent() {
        let scheduler = Scheduler::blocking(QuitSignal::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let outer = Arc::clone(&order);
        let nested_scheduler = scheduler.clone();

        scheduler.schedule_after(Duration::ZERO, move || {
            outer.lock().unwrap().push("parent-start");
            let nested = Arc::clone(&outer);
            nested_scheduler.schedule_after(Duration::from_millis(5), move || {
                nested.lock().unwrap().push("child");
            });
            outer.lock().unwrap().push("parent-end");
        });

        assert_eq!(
            *order.lock().unwrap(),
            vec!["parent-start", "parent-end", "child"]
        );
    }

    #[test]
    fn blocking_self_rescheduling_uses_constant_stack() {
        fn again(scheduler: Scheduler, left: Arc<AtomicUsize>) {
            if left.fetch_sub(1, Ordering::SeqCst) > 1 {
                let next = scheduler.clone();
                scheduler.schedule_after(Duration::ZERO, move || again(next, left));
            }
        }
        let scheduler = Scheduler::blocking(QuitSignal::new());
        let left = Arc::new(AtomicUsize::new(200_000));
        let counter = Arc::clone(&left);
        let first = scheduler.clone();

        scheduler.schedule_after(Duration::ZERO, move || again(first, counter));
        assert_eq!(left.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn blocking_queued_tasks_dropped_after_quit() {
        let quit = QuitSignal::new();
        let scheduler = Scheduler::blocking(quit.clone());
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let nested_scheduler = scheduler.clone();
        let start = Instant::now();

        scheduler.schedule_after(Duration::ZERO, move || {
            nested_scheduler.schedule_after(Duration::from_secs(5), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            quit.quit();
        });

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(start.elapsed() < Duration::from_secs(1), "must not sleep");
    }

    #[test]
    fn blocking_drain_resets_after_a_panic() {
        let scheduler = Scheduler::blocking(QuitSignal::new());
        let nested_scheduler = scheduler.clone();
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            scheduler.schedule_after(Duration::ZERO, move || {
                nested_scheduler.schedule_after(Duration::ZERO, || {});
                panic!("task exploded");
            });
        }));
        assert!(panicked.is_err());

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        scheduler.schedule_after(Duration::ZERO, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1, "runs inline again");
    }

    #[test]
    fn quitting_drops_tasks() {
        let quit = QuitSignal::new();
        let scheduler = Scheduler::blocking(quit.clone());
        quit.quit();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let start = Instant::now();

        assert!(!scheduler.schedule_after(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(start.elapsed() < Duration::from_secs(1), "must not sleep");
    }

    #[test]
    fn cooperative_zero_delay_off_loop_is_posted() {
        let mut ev = EventLoop::new();
        let scheduler = Scheduler::cooperative(QuitSignal::new(), ev.handle());
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        scheduler.schedule_after(Duration::ZERO, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0, "not run inline off the loop");

        assert_eq!(ev.run_ready(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cooperative_zero_delay_on_loop_runs_synchronously() {
        let mut ev = EventLoop::new();
        let handle = ev.handle();
        let scheduler = Scheduler::cooperative(QuitSignal::new(), handle.clone());
        let order = Arc::new(Mutex::new(Vec::new()));

        let inner_order = Arc::clone(&order);
        let inner_scheduler = scheduler.clone();
        handle.post(move || {
            inner_order.lock().unwrap().push("outer-start");
            let nested = Arc::clone(&inner_order);
            inner_scheduler.schedule_after(Duration::ZERO, move || {
                nested.lock().unwrap().push("nested");
            });
            inner_order.lock().unwrap().push("outer-end");
        });
        handle.request_exit();

        assert_eq!(ev.run_until(Duration::from_secs(5)), LoopExit::Requested);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer-start", "nested", "outer-end"]
        );
    }

    #[test]
    fn cooperative_delay_becomes_a_timer() {
        let mut ev = EventLoop::new();
        let handle = ev.handle();
        let scheduler = Scheduler::cooperative(QuitSignal::new(), handle.clone());
        let exit = handle.clone();
        let start = Instant::now();
        scheduler.schedule_after(Duration::from_millis(25), move || exit.request_exit());
        assert_eq!(handle.pending_timers(), 1);

        assert_eq!(ev.run_until(Duration::from_secs(5)), LoopExit::Requested);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn cancel_all_pending_quits_and_clears_timers() {
        let ev = EventLoop::new();
        let handle = ev.handle();
        let scheduler = Scheduler::cooperative(QuitSignal::new(), handle.clone());
        scheduler.schedule_after(Duration::from_secs(30), || {});
        scheduler.schedule_after(Duration::from_secs(31), || {});

        assert_eq!(scheduler.cancel_all_pending(), 2);
        assert!(scheduler.is_quitting());
        assert_eq!(handle.pending_timers(), 0);
        assert!(!scheduler.schedule_after(Duration::from_secs(1), || {}));
        assert_eq!(handle.pending_timers(), 0);
    }
}
