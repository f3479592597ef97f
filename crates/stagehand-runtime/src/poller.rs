#![forbid(unsafe_code)]

//! Condition poller: re-check a predicate until it holds or time runs out.
//!
//! A poll session starts with one immediate tick (zero delay) and then
//! reschedules itself every `interval` through the [`Scheduler`], so it
//! behaves identically in blocking and cooperative mode.
//!
//! # Resolution
//!
//! Every session resolves exactly once, in one of three ways:
//!
//! 1. **Success**: the predicate returned `true`; the continuation runs
//!    inline in that tick.
//! 2. **Failure**: the deadline passed (timeout handler or reporter), or
//!    the predicate/continuation returned an error or panicked (reporter).
//! 3. **Quiet abort**: the harness was quitting at the start of a tick.
//!    Neither the continuation nor any failure handler runs.
//!
//! The session owns its state and is moved from tick to tick, so two ticks
//! of the same session never run concurrently.
//!
//! # Timing
//!
//! The start instant is taken once when the session is created, from the
//! monotonic clock. A tick at elapsed `>= timeout` resolves as a timeout
//! without evaluating the predicate, so the timeout fires no earlier than
//! `timeout` and, barring a slow predicate, before `timeout + interval`.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::failure::{CheckError, Failure, FailureKind, FailureReporter, panic_message};
use crate::scheduler::Scheduler;

/// Default spacing between predicate evaluations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

type Predicate = Box<dyn FnMut() -> Result<bool, CheckError> + Send>;
type Continuation = Box<dyn FnOnce() -> Result<(), CheckError> + Send>;
type TimeoutHandler = Box<dyn FnOnce(Failure) + Send>;

/// What to wait for, and for how long.
pub struct Condition {
    timeout: Duration,
    interval: Duration,
    label: Option<String>,
    predicate: Predicate,
    on_timeout: Option<TimeoutHandler>,
}

impl Condition {
    /// Wait up to `timeout` for an infallible predicate.
    pub fn new(timeout: Duration, mut predicate: impl FnMut() -> bool + Send + 'static) -> Self {
        Self::fallible(timeout, move || Ok(predicate()))
    }

    /// Wait up to `timeout` for a predicate that may fail.
    ///
    /// An `Err` resolves the session as [`FailureKind::ConditionRaised`].
    pub fn fallible(
        timeout: Duration,
        predicate: impl FnMut() -> Result<bool, CheckError> + Send + 'static,
    ) -> Self {
        Self {
            timeout,
            interval: DEFAULT_POLL_INTERVAL,
            label: None,
            predicate: Box::new(predicate),
            on_timeout: None,
        }
    }

    /// Spacing between evaluations.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Label carried into failure messages.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Replace the default timeout handling (the reporter) with a callback.
    ///
    /// Used to retry at a higher level or collect evidence without failing.
    #[must_use]
    pub fn on_timeout(mut self, handler: impl FnOnce(Failure) + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(handler));
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        self.timeout
    }

    pub fn label_text(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("timeout", &self.timeout)
            .field("interval", &self.interval)
            .field("label", &self.label)
            .field("custom_timeout", &self.on_timeout.is_some())
            .finish_non_exhaustive()
    }
}

/// Starts poll sessions against a scheduler and a failure reporter.
#[derive(Clone)]
pub struct Poller {
    scheduler: Scheduler,
    reporter: Arc<dyn FailureReporter>,
    test_id: Option<Arc<str>>,
}

impl Poller {
    pub fn new(scheduler: Scheduler, reporter: Arc<dyn FailureReporter>) -> Self {
        Self {
            scheduler,
            reporter,
            test_id: None,
        }
    }

    /// Prefix failure messages with the running test's identifier.
    #[must_use]
    pub fn with_test_id(mut self, test_id: impl Into<Arc<str>>) -> Self {
        self.test_id = Some(test_id.into());
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn reporter(&self) -> &Arc<dyn FailureReporter> {
        &self.reporter
    }

    pub fn test_id(&self) -> Option<&str> {
        self.test_id.as_deref()
    }

    /// Poll `condition`, running `on_success` once it holds.
    pub fn poll_until(&self, condition: Condition, on_success: impl FnOnce() + Send + 'static) {
        self.try_poll_until(condition, move || {
            on_success();
            Ok(())
        });
    }

    /// Like [`poll_until`](Self::poll_until) with a fallible continuation.
    ///
    /// An `Err` (or panic) from the continuation is reported as
    /// [`FailureKind::ConditionRaised`].
    pub fn try_poll_until(
        &self,
        condition: Condition,
        on_success: impl FnOnce() -> Result<(), CheckError> + Send + 'static,
    ) {
        tracing::trace!(
            label = condition.label.as_deref().unwrap_or(""),
            timeout_ms = condition.timeout.as_millis() as u64,
            "poll session started"
        );
        let session = PollSession {
            condition,
            on_success: Box::new(on_success),
            started: Instant::now(),
            evaluations: 0,
            poller: self.clone(),
        };
        self.scheduler
            .schedule_after(Duration::ZERO, move || session.tick());
    }

    fn prefix(&self) -> String {
        match &self.test_id {
            Some(id) => format!("{id} - "),
            None => String::new(),
        }
    }

    fn stamp(&self, failure: Failure) -> Failure {
        match &self.test_id {
            Some(id) => failure.with_test_id(id.as_ref()),
            None => failure,
        }
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("scheduler", &self.scheduler)
            .field("test_id", &self.test_id)
            .finish_non_exhaustive()
    }
}

struct PollSession {
    condition: Condition,
    on_success: Continuation,
    started: Instant,
    evaluations: u32,
    poller: Poller,
}

impl PollSession {
    fn tick(mut self) {
        if self.poller.scheduler.is_quitting() {
            tracing::debug!(
                label = self.condition.label.as_deref().unwrap_or(""),
                evaluations = self.evaluations,
                "quitting; poll session aborted"
            );
            return;
        }

        let elapsed = self.started.elapsed();
        if elapsed >= self.condition.timeout {
            self.time_out(elapsed);
            return;
        }

        self.evaluations += 1;
        let verdict = catch_unwind(AssertUnwindSafe(|| (self.condition.predicate)()));
        match verdict {
            Ok(Ok(true)) => self.succeed(),
            Ok(Ok(false)) => {
                tracing::trace!(
                    label = self.condition.label.as_deref().unwrap_or(""),
                    evaluations = self.evaluations,
                    "condition not yet satisfied"
                );
                let scheduler = self.poller.scheduler.clone();
                let interval = self.condition.interval;
                scheduler.schedule_after(interval, move || self.tick());
            }
            Ok(Err(err)) => self.raise(err.to_string()),
            Err(payload) => self.raise(panic_message(payload.as_ref())),
        }
    }

    fn succeed(self) {
        let PollSession {
            condition,
            on_success,
            started,
            evaluations,
            poller,
        } = self;
        tracing::debug!(
            test_id = poller.test_id.as_deref().unwrap_or(""),
            label = condition.label.as_deref().unwrap_or(""),
            elapsed_ms = started.elapsed().as_millis() as u64,
            evaluations,
            "condition satisfied; running continuation"
        );
        let outcome = catch_unwind(AssertUnwindSafe(on_success));
        let detail = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };
        PollSession::report_raised(&poller, &condition, started.elapsed(), &detail);
    }

    fn raise(self, detail: String) {
        PollSession::report_raised(
            &self.poller,
            &self.condition,
            self.started.elapsed(),
            &detail,
        );
    }

    fn report_raised(poller: &Poller, condition: &Condition, elapsed: Duration, detail: &str) {
        let label = condition.label.as_deref().unwrap_or("no-assert-msg");
        let message = format!(
            "{}Condition or callback raised an exception, quitting ({label}): {detail}",
            poller.prefix()
        );
        tracing::warn!(%message, "poll session raised");
        let mut failure =
            poller.stamp(Failure::new(FailureKind::ConditionRaised, message).with_elapsed(elapsed));
        if let Some(label) = &condition.label {
            failure = failure.with_label(label.clone());
        }
        poller.reporter.report(failure);
    }

    fn time_out(self, elapsed: Duration) {
        let PollSession {
            condition,
            evaluations,
            poller,
            ..
        } = self;
        let label = condition.label.as_deref().unwrap_or("no-assert-msg");
        let message = format!(
            "{}{label} - Condition was not satisfied in {:.1} seconds (elapsed {:.2}s)",
            poller.prefix(),
            condition.timeout.as_secs_f64(),
            elapsed.as_secs_f64(),
        );
        tracing::debug!(
            test_id = poller.test_id.as_deref().unwrap_or(""),
            label,
            evaluations,
            custom_handler = condition.on_timeout.is_some(),
            "condition was not satisfied in time"
        );
        let mut failure = poller.stamp(
            Failure::new(FailureKind::ConditionTimeout, message).with_elapsed(elapsed),
        );
        if let Some(label) = &condition.label {
            failure = failure.with_label(label.clone());
        }
        match condition.on_timeout {
            Some(handler) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(move || handler(failure))) {
                    let detail = panic_message(payload.as_ref());
                    let message = format!(
                        "{}Timeout handler raised an exception ({label}): {detail}",
                        poller.prefix()
                    );
                    poller.reporter.report(
                        poller.stamp(Failure::new(FailureKind::ConditionRaised, message)),
                    );
                }
            }
            None => poller.reporter.report(failure),
        }
    }
}
