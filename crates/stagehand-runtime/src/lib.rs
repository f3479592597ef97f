#![forbid(unsafe_code)]

//! Stagehand runtime: the condition-polling scheduler.
//!
//! # Key Components
//!
//! - [`QuitSignal`] - Harness-wide quitting flag; suppresses further work
//! - [`EventLoop`] / [`LoopHandle`] - Single-threaded cooperative loop with
//!   cross-thread posting and timed tasks
//! - [`Scheduler`] - `schedule_after` in blocking or cooperative context
//! - [`Poller`] / [`Condition`] - Timeout-bounded, interval-spaced predicate
//!   re-checks with exactly-once resolution
//! - [`Failure`] / [`FailureReporter`] - Uniform failure vocabulary
//!
//! # How it fits in the system
//! `stagehand-harness` builds the bootstrap chain and teardown controller on
//! top of these primitives; `stagehand-core` supplies the collaborator
//! contracts the predicates query.

pub mod event_loop;
pub mod failure;
pub mod poller;
pub mod quit;
pub mod scheduler;

pub use event_loop::{EventLoop, LoopExit, LoopHandle, Task};
pub use failure::{CheckError, Failure, FailureKind, FailureLog, FailureReporter, panic_message};
pub use poller::{Condition, DEFAULT_POLL_INTERVAL, Poller};
pub use quit::QuitSignal;
pub use scheduler::{ExecutionContext, Scheduler};
