//! Staged bootstrap: wait for the application to come up one readiness
//! signal at a time.
//!
//! A [`BootstrapChain`] is an ordered list of [`Stage`]s. Each stage is a
//! poll session; only when stage *i* succeeds does stage *i + 1* start, on
//! a zero-delay reschedule. A stage that times out or raises is reported
//! with its own label, and every later stage is skipped.
//!
//! Before the first stage the chain runs its precondition (refusing to
//! start over a stale application instance) and then its launch step.
//! After the last stage, the ready continuation runs once the chain has
//! been going for at least the minimum settle time.
//!
//! ```text
//! precondition ─▶ launch ─▶ stage 1 ─▶ stage 2 ─▶ … ─▶ settle ─▶ on_ready
//!                               │          │
//!                               ╰──────────┴─▶ failure (stage label), chain stops
//! ```

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stagehand_core::{HarnessError, HarnessResult, LaunchConfig};
use stagehand_runtime::{CheckError, Condition, Failure, FailureKind, Poller, panic_message};

use crate::harness::{Harness, lock};

pub const STAGE_INSTANCE: &str = "application instance exists";
pub const STAGE_INIT: &str = "core service initialized";
pub const STAGE_CONTROLLER: &str = "UI controller registered";
pub const STAGE_WINDOW: &str = "main window ready";

type Predicate = Box<dyn FnMut() -> Result<bool, CheckError> + Send>;
type EnterHook = Box<dyn FnOnce() -> Result<(), CheckError> + Send>;
type Step = Box<dyn FnOnce() -> HarnessResult<()> + Send>;

/// One readiness signal to wait for.
pub struct Stage {
    label: String,
    timeout: Option<Duration>,
    interval: Option<Duration>,
    enter: Option<EnterHook>,
    predicate: Predicate,
}

impl Stage {
    pub fn new(label: impl Into<String>, mut predicate: impl FnMut() -> bool + Send + 'static) -> Self {
        Self::fallible(label, move || Ok(predicate()))
    }

    pub fn fallible(
        label: impl Into<String>,
        predicate: impl FnMut() -> Result<bool, CheckError> + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            timeout: None,
            interval: None,
            enter: None,
            predicate: Box::new(predicate),
        }
    }

    /// Override the chain's stage timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the chain's poll interval.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Run `hook` when the stage starts, before its first evaluation.
    /// An error resolves the stage as raised.
    #[must_use]
    pub fn on_enter(mut self, hook: impl FnOnce() -> Result<(), CheckError> + Send + 'static) -> Self {
        self.enter = Some(Box::new(hook));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("label", &self.label)
            .field("timeout", &self.timeout)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    current: Option<String>,
    completed: Vec<String>,
    ready: bool,
}

/// Shared view of how far a running chain got.
#[derive(Debug, Clone, Default)]
pub struct BootstrapProgress {
    state: Arc<Mutex<ProgressState>>,
}

impl BootstrapProgress {
    /// Labels of stages that succeeded, in order.
    pub fn completed(&self) -> Vec<String> {
        lock(&self.state).completed.clone()
    }

    /// Whether every stage succeeded.
    pub fn is_ready(&self) -> bool {
        lock(&self.state).ready
    }

    /// The stage in progress, or the one the chain stopped at.
    pub fn stalled_at(&self) -> Option<String> {
        let state = lock(&self.state);
        if state.ready { None } else { state.current.clone() }
    }

    fn enter(&self, label: &str) {
        lock(&self.state).current = Some(label.to_string());
    }

    fn complete(&self, label: &str) {
        let mut state = lock(&self.state);
        state.completed.push(label.to_string());
        state.current = None;
    }

    fn mark_ready(&self) {
        lock(&self.state).ready = true;
    }
}

/// Ordered readiness stages plus the steps around them.
pub struct BootstrapChain {
    stage_timeout: Duration,
    poll_interval: Duration,
    min_settle: Duration,
    precondition: Option<Step>,
    launch: Option<Step>,
    stages: Vec<Stage>,
}

impl BootstrapChain {
    /// Chain whose stages default to `stage_timeout` and `poll_interval`.
    pub fn new(stage_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            stage_timeout,
            poll_interval,
            min_settle: Duration::ZERO,
            precondition: None,
            launch: None,
            stages: Vec::new(),
        }
    }

    #[must_use]
    pub fn min_settle(mut self, floor: Duration) -> Self {
        self.min_settle = floor;
        self
    }

    /// Checked before anything is scheduled; an error aborts the chain.
    #[must_use]
    pub fn precondition(mut self, check: impl FnOnce() -> HarnessResult<()> + Send + 'static) -> Self {
        self.precondition = Some(Box::new(check));
        self
    }

    /// Starts the application once the precondition holds.
    #[must_use]
    pub fn launch(mut self, step: impl FnOnce() -> HarnessResult<()> + Send + 'static) -> Self {
        self.launch = Some(Box::new(step));
        self
    }

    #[must_use]
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.stages.iter().map(Stage::label).collect()
    }

    /// Start the chain on `poller`, running `on_ready` after the last stage.
    ///
    /// Errors only from the precondition or launch step; stage failures go
    /// to the poller's reporter. With a blocking scheduler the whole chain
    /// has resolved by the time this returns.
    pub fn run(
        self,
        poller: &Poller,
        on_ready: impl FnOnce() + Send + 'static,
    ) -> HarnessResult<BootstrapProgress> {
        if let Some(check) = self.precondition {
            check()?;
        }
        if let Some(launch) = self.launch {
            launch()?;
        }
        tracing::debug!(stages = self.stages.len(), "bootstrap started");

        let progress = BootstrapProgress::default();
        let plan = Plan {
            stages: self.stages.into(),
            stage_timeout: self.stage_timeout,
            poll_interval: self.poll_interval,
            min_settle: self.min_settle,
            started: Instant::now(),
            on_ready: Box::new(on_ready),
            progress: progress.clone(),
            poller: poller.clone(),
        };
        poller
            .scheduler()
            .schedule_after(Duration::ZERO, move || plan.advance());
        Ok(progress)
    }
}

impl std::fmt::Debug for BootstrapChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapChain")
            .field("stages", &self.labels())
            .field("min_settle", &self.min_settle)
            .finish_non_exhaustive()
    }
}

/// A running chain, moved from stage to stage.
struct Plan {
    stages: VecDeque<Stage>,
    stage_timeout: Duration,
    poll_interval: Duration,
    min_settle: Duration,
    started: Instant,
    on_ready: Box<dyn FnOnce() + Send>,
    progress: BootstrapProgress,
    poller: Poller,
}

impl Plan {
    fn advance(mut self) {
        let Some(stage) = self.stages.pop_front() else {
            self.finish();
            return;
        };
        let Stage {
            label,
            timeout,
            interval,
            enter,
            predicate,
        } = stage;
        self.progress.enter(&label);
        tracing::debug!(stage = %label, "bootstrap stage started");

        if let Some(hook) = enter {
            let outcome = catch_unwind(AssertUnwindSafe(hook))
                .unwrap_or_else(|payload| Err(panic_message(payload.as_ref()).into()));
            if let Err(e) = outcome {
                let message = format!(
                    "{} - Bootstrap stage could not start, quitting ({label}): {e}",
                    self.poller.test_id().unwrap_or("")
                );
                self.poller
                    .reporter()
                    .report(Failure::new(FailureKind::ConditionRaised, message).with_label(label));
                return;
            }
        }

        let condition = Condition::fallible(timeout.unwrap_or(self.stage_timeout), predicate)
            .interval(interval.unwrap_or(self.poll_interval))
            .label(label.clone());
        let poller = self.poller.clone();
        poller.poll_until(condition, move || {
            tracing::debug!(stage = %label, "bootstrap stage ready");
            self.progress.complete(&label);
            let scheduler = self.poller.scheduler().clone();
            scheduler.schedule_after(Duration::ZERO, move || self.advance());
        });
    }

    fn finish(self) {
        self.progress.mark_ready();
        let took = self.started.elapsed();
        let remaining = self.min_settle.saturating_sub(took);
        tracing::info!(
            took_ms = took.as_millis() as u64,
            settle_ms = remaining.as_millis() as u64,
            "bootstrap complete"
        );
        if remaining.is_zero() {
            (self.on_ready)();
        } else {
            self.poller.scheduler().schedule_after(remaining, self.on_ready);
        }
    }
}

/// The standard chain for `harness`: instance, initialization, and with a
/// front-end, controller registration and the main window.
pub fn standard_chain(harness: &Harness, launch: LaunchConfig) -> BootstrapChain {
    let config = harness.config();
    let app = Arc::clone(&harness.collaborators().app);
    let mut chain = BootstrapChain::new(config.stage_timeout, config.poll_interval)
        .min_settle(config.effective_min_settle(harness.has_ui()));

    let guard = Arc::clone(&app);
    chain = chain.precondition(move || {
        if guard.instance_exists() {
            Err(HarnessError::StaleInstance)
        } else {
            Ok(())
        }
    });
    let launcher = Arc::clone(&app);
    chain = chain.launch(move || launcher.launch(&launch));

    let probe = Arc::clone(&app);
    chain = chain.stage(Stage::new(STAGE_INSTANCE, move || probe.instance_exists()));

    let fetch = harness.clone();
    let watch = harness.clone();
    chain = chain.stage(
        Stage::new(STAGE_INIT, move || {
            watch.instance().is_some_and(|i| i.init_complete())
        })
        .on_enter(move || {
            let instance = app.instance().ok_or(HarnessError::NoInstance)?;
            fetch.set_instance(instance);
            Ok(())
        }),
    );

    if let Some(ui) = harness.collaborators().ui.clone() {
        let register = harness.clone();
        chain = chain.stage(Stage::new(STAGE_CONTROLLER, move || {
            if !ui.controller_exists() {
                return false;
            }
            match ui.controller() {
                Some(controller) if controller.registered() => {
                    register.set_controller(controller);
                    true
                }
                _ => false,
            }
        }));

        let fetch = harness.clone();
        let watch = harness.clone();
        chain = chain.stage(
            Stage::new(STAGE_WINDOW, move || {
                watch.main_window().is_some_and(|w| w.ready())
            })
            .on_enter(move || {
                let controller = fetch.controller().ok_or("UI controller disappeared")?;
                let window = controller
                    .main_window()
                    .ok_or("main window was not created")?;
                window.maximize();
                fetch.set_window(window);
                Ok(())
            }),
        );
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stagehand_runtime::{FailureLog, QuitSignal, Scheduler};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn blocking_poller() -> (Poller, FailureLog) {
        let log = FailureLog::new();
        let poller = Poller::new(Scheduler::blocking(QuitSignal::new()), Arc::new(log.clone()))
            .with_test_id("test_chain");
        (poller, log)
    }

    fn chain() -> BootstrapChain {
        BootstrapChain::new(Duration::from_millis(200), Duration::from_millis(10))
    }

    #[test]
    fn stages_complete_in_order() {
        let (poller, log) = blocking_poller();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&order), Arc::clone(&order));
        let ready = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&ready);

        let progress = chain()
            .stage(Stage::new("one", move || {
                a.lock().unwrap().push("one");
                true
            }))
            .stage(Stage::new("two", move || {
                b.lock().unwrap().push("two");
                true
            }))
            .run(&poller, move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["one", "two"]);
        assert_eq!(ready.load(Ordering::SeqCst), 1);
        assert!(progress.is_ready());
        assert_eq!(progress.completed(), vec!["one", "two"]);
        assert!(log.is_empty());
    }

    #[test]
    fn failing_stage_stops_the_chain() {
        let (poller, log) = blocking_poller();
        let later = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&later);

        let progress = chain()
            .stage(Stage::new("first", || true))
            .stage(Stage::new("stuck", || false).timeout(Duration::from_millis(50)))
            .stage(Stage::new("never", move || {
                probe.fetch_add(1, Ordering::SeqCst);
                true
            }))
            .run(&poller, || panic!("must not become ready"))
            .unwrap();

        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert!(!progress.is_ready());
        assert_eq!(progress.completed(), vec!["first"]);
        assert_eq!(progress.stalled_at().as_deref(), Some("stuck"));
        let failures = log.snapshot();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].label.as_deref(), Some("stuck"));
        assert_eq!(failures[0].kind, FailureKind::ConditionTimeout);
    }

    #[test]
    fn precondition_error_schedules_nothing() {
        let (poller, log) = blocking_poller();
        let launched = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&launched);

        let err = chain()
            .precondition(|| Err(HarnessError::StaleInstance))
            .launch(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .stage(Stage::new("unreached", || panic!("evaluated")))
            .run(&poller, || {})
            .unwrap_err();

        assert!(matches!(err, HarnessError::StaleInstance));
        assert_eq!(launched.load(Ordering::SeqCst), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn failing_enter_hook_reports_stage_label() {
        let (poller, log) = blocking_poller();
        let progress = chain()
            .stage(Stage::new("window", || true).on_enter(|| Err("no window".into())))
            .run(&poller, || {})
            .unwrap();

        assert!(!progress.is_ready());
        let failures = log.snapshot();
        assert_eq!(failures[0].kind, FailureKind::ConditionRaised);
        assert_eq!(failures[0].label.as_deref(), Some("window"));
        assert!(failures[0].message.contains("no window"));
    }

    #[test]
    fn min_settle_delays_the_ready_continuation() {
        let (poller, _log) = blocking_poller();
        let start = Instant::now();
        let ran_at = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&ran_at);

        chain()
            .min_settle(Duration::from_millis(80))
            .stage(Stage::new("instant", || true))
            .run(&poller, move || *slot.lock().unwrap() = Some(start.elapsed()))
            .unwrap();

        let elapsed = ran_at.lock().unwrap().unwrap();
        assert!(elapsed >= Duration::from_millis(80), "{elapsed:?}");
    }

    #[test]
    fn empty_chain_is_ready_immediately() {
        let (poller, _log) = blocking_poller();
        let progress = chain().run(&poller, || {}).unwrap();
        assert!(progress.is_ready());
        assert!(chain().is_empty());
    }
}
