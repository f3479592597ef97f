//! In-memory doubles for every collaborator trait.
//!
//! [`FakeApp`] simulates an application that becomes ready in stages after
//! [`AppRegistry::launch`]. Each stage is driven purely by elapsed time since
//! launch, so tests stay deterministic without spawning threads. Every
//! readiness query is appended to a probe log, which lets tests assert the
//! order in which the harness looked at things.
//!
//! ```ignore
//! let app = FakeApp::new(FakeTimings::immediate().init_after(Duration::from_millis(200)));
//! app.launch(&LaunchConfig::default())?;
//! assert!(app.instance_exists());
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::app::{
    AppInstance, AppRegistry, DiagnosticCapture, LaunchConfig, MainWindow, UiController,
    UiRegistry,
};
use crate::error::HarnessResult;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Offsets (from launch) at which each part of the fake becomes ready.
///
/// `None` means "never".
#[derive(Debug, Clone)]
pub struct FakeTimings {
    pub instance_after: Option<Duration>,
    pub init_after: Option<Duration>,
    pub controller_after: Option<Duration>,
    pub registered_after: Option<Duration>,
    pub window_ready_after: Option<Duration>,
    /// How long shutdown takes once requested.
    pub shutdown_takes: Option<Duration>,
}

impl FakeTimings {
    /// Everything is ready the moment the application is launched.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            instance_after: Some(Duration::ZERO),
            init_after: Some(Duration::ZERO),
            controller_after: Some(Duration::ZERO),
            registered_after: Some(Duration::ZERO),
            window_ready_after: Some(Duration::ZERO),
            shutdown_takes: Some(Duration::ZERO),
        }
    }

    #[must_use]
    pub fn instance_after(mut self, after: Duration) -> Self {
        self.instance_after = Some(after);
        self
    }

    #[must_use]
    pub fn init_after(mut self, after: Duration) -> Self {
        self.init_after = Some(after);
        self
    }

    #[must_use]
    pub fn never_init(mut self) -> Self {
        self.init_after = None;
        self
    }

    #[must_use]
    pub fn controller_after(mut self, after: Duration) -> Self {
        self.controller_after = Some(after);
        self
    }

    #[must_use]
    pub fn registered_after(mut self, after: Duration) -> Self {
        self.registered_after = Some(after);
        self
    }

    #[must_use]
    pub fn window_ready_after(mut self, after: Duration) -> Self {
        self.window_ready_after = Some(after);
        self
    }

    #[must_use]
    pub fn shutdown_takes(mut self, takes: Duration) -> Self {
        self.shutdown_takes = Some(takes);
        self
    }

    #[must_use]
    pub fn never_shuts_down(mut self) -> Self {
        self.shutdown_takes = None;
        self
    }
}

impl Default for FakeTimings {
    fn default() -> Self {
        Self::immediate()
    }
}

#[derive(Debug, Default)]
struct InstanceSlot {
    present: bool,
    created_once: bool,
    shutdown_requested_at: Option<Instant>,
}

#[derive(Debug)]
struct FakeState {
    timings: FakeTimings,
    launched_at: Mutex<Option<Instant>>,
    slot: Mutex<InstanceSlot>,
    last_launch: Mutex<Option<LaunchConfig>>,
    probes: Mutex<Vec<&'static str>>,
    shutdown_calls: AtomicUsize,
    maximize_calls: AtomicUsize,
    close_calls: AtomicUsize,
    secondary_close_calls: AtomicUsize,
    exit_requests: AtomicUsize,
}

impl FakeState {
    fn probe(&self, name: &'static str) {
        lock(&self.probes).push(name);
    }

    fn since_launch_reached(&self, offset: Option<Duration>) -> bool {
        match (*lock(&self.launched_at), offset) {
            (Some(at), Some(offset)) => at.elapsed() >= offset,
            _ => false,
        }
    }

    /// Materialize the instance once its creation time has passed.
    fn refresh_slot(&self) -> bool {
        let due = self.since_launch_reached(self.timings.instance_after);
        let mut slot = lock(&self.slot);
        if !slot.present && !slot.created_once && due {
            slot.present = true;
            slot.created_once = true;
        }
        slot.present
    }
}

/// A scripted application: registry, instance, UI controller, and window.
#[derive(Debug, Clone)]
pub struct FakeApp {
    state: Arc<FakeState>,
}

impl FakeApp {
    /// Create a fake that follows the given readiness timings.
    #[must_use]
    pub fn new(timings: FakeTimings) -> Self {
        Self {
            state: Arc::new(FakeState {
                timings,
                launched_at: Mutex::new(None),
                slot: Mutex::new(InstanceSlot::default()),
                last_launch: Mutex::new(None),
                probes: Mutex::new(Vec::new()),
                shutdown_calls: AtomicUsize::new(0),
                maximize_calls: AtomicUsize::new(0),
                close_calls: AtomicUsize::new(0),
                secondary_close_calls: AtomicUsize::new(0),
                exit_requests: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a fake whose instance is already registered, as if a previous
    /// test never tore it down.
    #[must_use]
    pub fn with_stale_instance(timings: FakeTimings) -> Self {
        let app = Self::new(timings);
        {
            let mut slot = lock(&app.state.slot);
            slot.present = true;
            slot.created_once = true;
        }
        app
    }

    /// Readiness queries in the order they were made.
    pub fn probes(&self) -> Vec<&'static str> {
        lock(&self.state.probes).clone()
    }

    /// Forget recorded probes.
    pub fn clear_probes(&self) {
        lock(&self.state.probes).clear();
    }

    /// The config passed to the most recent launch.
    pub fn last_launch(&self) -> Option<LaunchConfig> {
        lock(&self.state.last_launch).clone()
    }

    pub fn shutdown_calls(&self) -> usize {
        self.state.shutdown_calls.load(Ordering::SeqCst)
    }

    pub fn maximize_calls(&self) -> usize {
        self.state.maximize_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    pub fn secondary_close_calls(&self) -> usize {
        self.state.secondary_close_calls.load(Ordering::SeqCst)
    }

    pub fn exit_requests(&self) -> usize {
        self.state.exit_requests.load(Ordering::SeqCst)
    }
}

impl AppRegistry for FakeApp {
    fn launch(&self, config: &LaunchConfig) -> HarnessResult<()> {
        *lock(&self.state.launched_at) = Some(Instant::now());
        *lock(&self.state.last_launch) = Some(config.clone());
        Ok(())
    }

    fn instance_exists(&self) -> bool {
        self.state.probe("instance_exists");
        self.state.refresh_slot()
    }

    fn instance(&self) -> Option<Arc<dyn AppInstance>> {
        if self.state.refresh_slot() {
            Some(Arc::new(FakeInstance {
                state: Arc::clone(&self.state),
            }))
        } else {
            None
        }
    }

    fn remove_instance(&self) {
        lock(&self.state.slot).present = false;
    }
}

impl UiRegistry for FakeApp {
    fn controller_exists(&self) -> bool {
        self.state.probe("controller_exists");
        self.state
            .since_launch_reached(self.state.timings.controller_after)
    }

    fn controller(&self) -> Option<Arc<dyn UiController>> {
        if self
            .state
            .since_launch_reached(self.state.timings.controller_after)
        {
            Some(Arc::new(FakeController {
                state: Arc::clone(&self.state),
            }))
        } else {
            None
        }
    }
}

struct FakeInstance {
    state: Arc<FakeState>,
}

impl AppInstance for FakeInstance {
    fn init_complete(&self) -> bool {
        self.state.probe("init_complete");
        self.state.since_launch_reached(self.state.timings.init_after)
    }

    fn shutdown(&self) {
        self.state.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        let mut slot = lock(&self.state.slot);
        if slot.shutdown_requested_at.is_none() {
            slot.shutdown_requested_at = Some(Instant::now());
        }
    }

    fn has_shutdown(&self) -> bool {
        let requested = lock(&self.state.slot).shutdown_requested_at;
        match (requested, self.state.timings.shutdown_takes) {
            (Some(at), Some(takes)) => at.elapsed() >= takes,
            _ => false,
        }
    }

    fn statistics(&self) -> Value {
        json!({
            "session": {
                "state_dir": lock(&self.state.last_launch)
                    .as_ref()
                    .map(|c| c.state_dir.display().to_string())
                    .unwrap_or_default(),
                "probes": lock(&self.state.probes).len(),
            },
            "status": "running",
        })
    }
}

struct FakeController {
    state: Arc<FakeState>,
}

impl UiController for FakeController {
    fn registered(&self) -> bool {
        self.state.probe("registered");
        self.state
            .since_launch_reached(self.state.timings.registered_after)
    }

    fn main_window(&self) -> Option<Arc<dyn MainWindow>> {
        if self
            .state
            .since_launch_reached(self.state.timings.registered_after)
        {
            Some(Arc::new(FakeWindow {
                state: Arc::clone(&self.state),
            }))
        } else {
            None
        }
    }

    fn close_secondary_windows(&self) {
        self.state
            .secondary_close_calls
            .fetch_add(1, Ordering::SeqCst);
    }

    fn request_exit(&self) {
        self.state.exit_requests.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeWindow {
    state: Arc<FakeState>,
}

impl MainWindow for FakeWindow {
    fn ready(&self) -> bool {
        self.state.probe("window_ready");
        self.state
            .since_launch_reached(self.state.timings.window_ready_after)
    }

    fn maximize(&self) {
        self.state.maximize_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records capture labels instead of taking screenshots.
#[derive(Debug, Default)]
pub struct FakeCapture {
    labels: Mutex<Vec<String>>,
}

impl FakeCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels captured so far.
    pub fn labels(&self) -> Vec<String> {
        lock(&self.labels).clone()
    }
}

impl DiagnosticCapture for FakeCapture {
    fn capture(&self, label: &str) {
        lock(&self.labels).push(label.to_string());
    }
}
