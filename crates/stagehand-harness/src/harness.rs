//! Per-test harness state: quitting flag, failure record, application
//! handles, and the quiesce controller.
//!
//! # Failure handling
//!
//! [`Harness`] is the [`FailureReporter`] every poll session reports to.
//! A report always logs at `warn` and captures diagnostics when a capture
//! collaborator exists. What happens next depends on [`FailureMode`]:
//!
//! - `Fatal`: quit, then record the failure for replay at teardown.
//! - `Soft`: keep a note; the test goes on and teardown ignores it.
//!
//! Bootstrap stages report through [`Harness::bootstrap_poller`], which is
//! always fatal: a test whose application never came up cannot pass.
//!
//! # Quiesce
//!
//! [`Harness::quit`] sets quitting first, so pending poll sessions abort at
//! their next tick. With a front-end, closing it is scheduled on the loop
//! directly (not through the quit-gated scheduler):
//!
//! | Main window | Action |
//! |-------------|--------|
//! | present | close it now; exit after `close_delays.loop_exit` |
//! | absent | close secondary windows after `close_delays.secondary_windows`, exit after `close_delays.loop_exit` |
//!
//! When the loop is not running (teardown after the loop returned), the
//! same actions run synchronously.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use stagehand_core::{AppInstance, Collaborators, HarnessResult, MainWindow, UiController};
use stagehand_runtime::{
    Failure, FailureKind, FailureLog, FailureReporter, LoopHandle, Poller, QuitSignal, Scheduler,
};

use crate::annotate::AnnotationLog;
use crate::config::{CloseDelays, FailureMode, HarnessConfig};
use crate::diagnostics::dump_statistics;

/// Handles fetched during bootstrap, dropped at teardown.
#[derive(Clone, Default)]
pub(crate) struct AppHandles {
    pub(crate) instance: Option<Arc<dyn AppInstance>>,
    pub(crate) controller: Option<Arc<dyn UiController>>,
    pub(crate) window: Option<Arc<dyn MainWindow>>,
}

pub(crate) struct Shared {
    pub(crate) test_id: Arc<str>,
    pub(crate) config: HarnessConfig,
    pub(crate) collaborators: Collaborators,
    pub(crate) quit: QuitSignal,
    closing: AtomicBool,
    pub(crate) failures: FailureLog,
    notes: FailureLog,
    handles: Mutex<AppHandles>,
    pub(crate) loop_handle: Option<LoopHandle>,
    pub(crate) annotations: Mutex<AnnotationLog>,
}

/// Cheap-to-clone handle on one test's harness state.
#[derive(Clone)]
pub struct Harness {
    pub(crate) inner: Arc<Shared>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Harness {
    /// Harness for `test_id`. Pass the loop handle when a front-end is
    /// under test; without one, scheduling is blocking.
    pub fn new(
        test_id: impl Into<Arc<str>>,
        config: HarnessConfig,
        collaborators: Collaborators,
        loop_handle: Option<LoopHandle>,
    ) -> Self {
        let annotations = AnnotationLog::new(config.output_dir.clone());
        Self {
            inner: Arc::new(Shared {
                test_id: test_id.into(),
                config,
                collaborators,
                quit: QuitSignal::new(),
                closing: AtomicBool::new(false),
                failures: FailureLog::new(),
                notes: FailureLog::new(),
                handles: Mutex::new(AppHandles::default()),
                loop_handle,
                annotations: Mutex::new(annotations),
            }),
        }
    }

    pub fn test_id(&self) -> &str {
        &self.inner.test_id
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.inner.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.inner.collaborators
    }

    pub fn has_ui(&self) -> bool {
        self.inner.collaborators.has_ui()
    }

    pub fn loop_handle(&self) -> Option<&LoopHandle> {
        self.inner.loop_handle.as_ref()
    }

    /// Scheduler gated by this harness's quitting flag.
    pub fn scheduler(&self) -> Scheduler {
        match &self.inner.loop_handle {
            Some(handle) => Scheduler::cooperative(self.inner.quit.clone(), handle.clone()),
            None => Scheduler::blocking(self.inner.quit.clone()),
        }
    }

    /// Poller reporting to this harness.
    pub fn poller(&self) -> Poller {
        Poller::new(self.scheduler(), Arc::new(self.clone()))
            .with_test_id(Arc::clone(&self.inner.test_id))
    }

    /// Poller for bootstrap stages. Its failures are fatal in every mode.
    pub fn bootstrap_poller(&self) -> Poller {
        Poller::new(self.scheduler(), Arc::new(Escalate(self.clone())))
            .with_test_id(Arc::clone(&self.inner.test_id))
    }

    pub fn is_quitting(&self) -> bool {
        self.inner.quit.is_quitting()
    }

    /// Reset per-test state and open the test's annotation.
    pub fn setup(&self) -> HarnessResult<()> {
        self.inner.quit.reset();
        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.failures.drain();
        self.inner.notes.drain();
        if self.inner.config.annotate {
            lock(&self.inner.annotations).start(&self.inner.test_id)?;
        }
        tracing::debug!(test_id = %self.inner.test_id, ui = self.has_ui(), "harness set up");
        Ok(())
    }

    /// Failures recorded for replay, oldest first.
    pub fn failures(&self) -> Vec<Failure> {
        self.inner.failures.snapshot()
    }

    /// Soft-mode notes, oldest first.
    pub fn notes(&self) -> Vec<Failure> {
        self.inner.notes.snapshot()
    }

    pub fn instance(&self) -> Option<Arc<dyn AppInstance>> {
        self.handles().instance.clone()
    }

    pub fn controller(&self) -> Option<Arc<dyn UiController>> {
        self.handles().controller.clone()
    }

    pub fn main_window(&self) -> Option<Arc<dyn MainWindow>> {
        self.handles().window.clone()
    }

    pub(crate) fn handles(&self) -> MutexGuard<'_, AppHandles> {
        lock(&self.inner.handles)
    }

    pub(crate) fn set_instance(&self, instance: Arc<dyn AppInstance>) {
        self.handles().instance = Some(instance);
    }

    pub(crate) fn set_controller(&self, controller: Arc<dyn UiController>) {
        self.handles().controller = Some(controller);
    }

    pub(crate) fn set_window(&self, window: Arc<dyn MainWindow>) {
        self.handles().window = Some(window);
    }

    /// Report a failed assertion unless `condition` holds. Returns `condition`.
    pub fn assert_that(&self, condition: bool, reason: impl Into<String>) -> bool {
        if !condition {
            let reason = reason.into();
            self.report(
                Failure::new(FailureKind::Assertion, format!("{} - {reason}", self.test_id()))
                    .with_label(reason),
            );
        }
        condition
    }

    /// Move panics caught on the loop into the failure record.
    ///
    /// Background panics are always fatal, whatever the failure mode.
    pub fn check_background(&self) -> usize {
        let Some(handle) = &self.inner.loop_handle else {
            return 0;
        };
        let panics = handle.take_background_panics();
        for message in &panics {
            self.record(
                FailureKind::BackgroundPanic,
                format!("unhandled panic on the event loop: {message}"),
            );
        }
        panics.len()
    }

    /// Record a fatal failure directly, bypassing the failure mode.
    pub(crate) fn record(&self, kind: FailureKind, reason: String) {
        tracing::error!(test_id = %self.test_id(), %kind, "{reason}");
        self.inner.failures.push(
            Failure::new(kind, format!("{} - {reason}", self.test_id())).with_test_id(self.test_id()),
        );
    }

    /// Begin shutting the test down. Idempotent.
    pub fn quit(&self) {
        self.inner.quit.quit();
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(test_id = %self.test_id(), "quitting");
        let Some(handle) = &self.inner.loop_handle else {
            return;
        };
        let (controller, window) = {
            let handles = self.handles();
            (handles.controller.clone(), handles.window.clone())
        };
        if handle.is_running() {
            schedule_close(handle, controller, window, self.inner.config.close_delays);
        } else {
            close_now(controller, window);
        }
    }
}

fn schedule_close(
    handle: &LoopHandle,
    controller: Option<Arc<dyn UiController>>,
    window: Option<Arc<dyn MainWindow>>,
    delays: CloseDelays,
) {
    match window {
        Some(window) => handle.post(move || window.close()),
        None => {
            let secondary = controller.clone();
            handle.post_after(delays.secondary_windows, move || {
                if let Some(controller) = secondary {
                    controller.close_secondary_windows();
                }
            });
        }
    }
    let exit = handle.clone();
    handle.post_after(delays.loop_exit, move || {
        if let Some(controller) = controller {
            controller.request_exit();
        }
        exit.request_exit();
    });
}

fn close_now(controller: Option<Arc<dyn UiController>>, window: Option<Arc<dyn MainWindow>>) {
    match (&window, &controller) {
        (Some(window), _) => window.close(),
        (None, Some(controller)) => controller.close_secondary_windows(),
        (None, None) => {}
    }
    if let Some(controller) = controller {
        controller.request_exit();
    }
}

impl FailureReporter for Harness {
    fn report(&self, failure: Failure) {
        self.handle_failure(failure, self.inner.config.failure_mode);
    }
}

/// Reporter that treats every failure as fatal.
struct Escalate(Harness);

impl FailureReporter for Escalate {
    fn report(&self, failure: Failure) {
        self.0.handle_failure(failure, FailureMode::Fatal);
    }
}

impl Harness {
    fn handle_failure(&self, failure: Failure, mode: FailureMode) {
        let failure = match failure.test_id {
            Some(_) => failure,
            None => failure.with_test_id(self.test_id()),
        };
        tracing::warn!(
            test_id = %self.test_id(),
            kind = %failure.kind,
            label = failure.label_or_default(),
            ?mode,
            "{}",
            failure.message
        );

        if self.inner.config.dump_statistics && failure.kind == FailureKind::ConditionTimeout {
            match self.instance() {
                Some(instance) => dump_statistics(&instance.statistics()),
                None => tracing::debug!("no instance; statistics not dumped"),
            }
        }
        if let Some(capture) = &self.inner.collaborators.diagnostics {
            capture.capture(&format!("ASSERT: {}", failure.label_or_default()));
        }

        match mode {
            FailureMode::Fatal => {
                self.quit();
                self.inner.failures.push(failure);
            }
            FailureMode::Soft => self.inner.notes.push(failure),
        }
    }
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("test_id", &self.inner.test_id)
            .field("ui", &self.has_ui())
            .field("quitting", &self.is_quitting())
            .field("failures", &self.inner.failures.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::fake::{FakeApp, FakeCapture, FakeTimings};
    use stagehand_core::{AppRegistry, LaunchConfig, UiRegistry};
    use stagehand_runtime::{EventLoop, LoopExit};
    use std::time::Duration;

    fn launched_gui(ev: &EventLoop) -> (FakeApp, Harness) {
        let fake = FakeApp::new(FakeTimings::immediate());
        let app = Arc::new(fake.clone());
        let collaborators =
            Collaborators::with_ui(app.clone(), app, Arc::new(FakeCapture::new()));
        let config = quiet().with_close_delays(Duration::from_millis(5), Duration::from_millis(20));
        let harness = Harness::new("test_quit", config, collaborators, Some(ev.handle()));
        fake.launch(&LaunchConfig::default()).unwrap();
        (fake, harness)
    }

    fn headless(config: HarnessConfig) -> Harness {
        let app = FakeApp::new(FakeTimings::immediate());
        Harness::new("test_unit", config, Collaborators::headless(Arc::new(app)), None)
    }

    fn quiet() -> HarnessConfig {
        HarnessConfig::default().with_annotate(false)
    }

    #[test]
    fn fatal_report_quits_and_records() {
        let harness = headless(quiet());
        harness.report(Failure::new(FailureKind::ConditionTimeout, "late").with_label("wait"));
        assert!(harness.is_quitting());
        let failures = harness.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].test_id.as_deref(), Some("test_unit"));
    }

    #[test]
    fn soft_report_keeps_running() {
        let harness = headless(quiet().with_failure_mode(FailureMode::Soft));
        assert!(!harness.assert_that(false, "window title"));
        assert!(!harness.is_quitting());
        assert!(harness.failures().is_empty());
        assert_eq!(harness.notes()[0].label.as_deref(), Some("window title"));
    }

    #[test]
    fn bootstrap_failures_are_fatal_in_soft_mode() {
        let harness = headless(quiet().with_failure_mode(FailureMode::Soft));
        let poller = harness.bootstrap_poller();
        poller.reporter().report(
            Failure::new(FailureKind::ConditionTimeout, "stage stalled").with_label("stage two"),
        );
        assert!(harness.is_quitting());
        assert!(harness.notes().is_empty());
        assert_eq!(harness.failures()[0].label.as_deref(), Some("stage two"));
    }

    #[test]
    fn passing_assertion_records_nothing() {
        let harness = headless(quiet());
        assert!(harness.assert_that(true, "fine"));
        assert!(harness.failures().is_empty());
        assert!(!harness.is_quitting());
    }

    #[test]
    fn report_captures_with_assert_prefix() {
        let app = Arc::new(FakeApp::new(FakeTimings::immediate()));
        let capture = Arc::new(FakeCapture::new());
        let collaborators = Collaborators::with_ui(app.clone(), app, capture.clone());
        let ev = EventLoop::new();
        let harness = Harness::new("test_gui", quiet(), collaborators, Some(ev.handle()));

        harness.assert_that(false, "title shown");
        assert_eq!(capture.labels(), vec!["ASSERT: title shown".to_string()]);
    }

    #[test]
    fn setup_clears_quitting_and_failures() {
        let harness = headless(quiet());
        harness.assert_that(false, "stale");
        harness.setup().unwrap();
        assert!(!harness.is_quitting());
        assert!(harness.failures().is_empty());
    }

    #[test]
    fn quit_with_window_closes_it_then_exits_loop() {
        let mut ev = EventLoop::new();
        let (fake, harness) = launched_gui(&ev);
        let controller = fake.controller().unwrap();
        harness.set_window(controller.main_window().unwrap());
        harness.set_controller(controller);

        let quitter = harness.clone();
        ev.handle().post(move || quitter.quit());
        assert_eq!(ev.run_until(Duration::from_secs(5)), LoopExit::Requested);
        assert_eq!(fake.close_calls(), 1);
        assert_eq!(fake.exit_requests(), 1);
        assert_eq!(fake.secondary_close_calls(), 0);
    }

    #[test]
    fn quit_without_window_closes_secondary_windows() {
        let mut ev = EventLoop::new();
        let (fake, harness) = launched_gui(&ev);
        harness.set_controller(fake.controller().unwrap());

        let quitter = harness.clone();
        ev.handle().post(move || {
            quitter.quit();
            quitter.quit();
        });
        assert_eq!(ev.run_until(Duration::from_secs(5)), LoopExit::Requested);
        assert_eq!(fake.secondary_close_calls(), 1);
        assert_eq!(fake.exit_requests(), 1);
        assert_eq!(fake.close_calls(), 0);
    }

    #[test]
    fn quit_off_loop_closes_synchronously() {
        let ev = EventLoop::new();
        let (fake, harness) = launched_gui(&ev);
        harness.set_controller(fake.controller().unwrap());
        harness.quit();
        assert_eq!(fake.secondary_close_calls(), 1);
        assert_eq!(fake.exit_requests(), 1);
        assert_eq!(ev.handle().pending_timers(), 0);
    }

    #[test]
    fn background_panics_become_failures() {
        let mut ev = EventLoop::new();
        let app = FakeApp::new(FakeTimings::immediate());
        let harness = Harness::new(
            "test_bg",
            quiet().with_failure_mode(FailureMode::Soft),
            Collaborators::headless(Arc::new(app)),
            Some(ev.handle()),
        );
        ev.handle().post(|| panic!("worker exploded"));
        ev.run_ready();

        assert_eq!(harness.check_background(), 1);
        let failures = harness.failures();
        assert_eq!(failures[0].kind, FailureKind::BackgroundPanic);
        assert!(failures[0].message.contains("worker exploded"));
    }
}
