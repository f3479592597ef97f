//! Test fixture: setup, bootstrap, body, background check, teardown.
//!
//! ```ignore
//! use stagehand_harness::{HarnessConfig, run_test};
//!
//! run_test("test_search", HarnessConfig::from_env()?, collaborators, |ctx| {
//!     ctx.assert_that(ctx.instance().is_some(), "instance after bootstrap");
//! })?;
//! ```
//!
//! Without a front-end the body runs on the calling thread once bootstrap
//! has succeeded, and every poll it starts resolves before it returns.
//! With a front-end the body runs on the event loop, which keeps running on
//! the calling thread until [`TestContext::quit`] is called (or the loop
//! ceiling passes). A body that panics still gets a full teardown; the
//! panic is resumed afterwards.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use stagehand_core::{AppInstance, Collaborators, HarnessError, HarnessResult, LaunchConfig, MainWindow};
use stagehand_runtime::{EventLoop, FailureKind, LoopExit, Poller, Scheduler};

use crate::bootstrap::standard_chain;
use crate::config::HarnessConfig;
use crate::harness::{Harness, lock};
use crate::workspace::SessionWorkspace;

type PanicPayload = Box<dyn Any + Send>;

/// What a test body gets to work with. Clone it into poll continuations.
#[derive(Clone, Debug)]
pub struct TestContext {
    harness: Harness,
}

impl TestContext {
    pub fn harness(&self) -> &Harness {
        &self.harness
    }

    pub fn scheduler(&self) -> Scheduler {
        self.harness.scheduler()
    }

    pub fn poller(&self) -> Poller {
        self.harness.poller()
    }

    pub fn instance(&self) -> Option<Arc<dyn AppInstance>> {
        self.harness.instance()
    }

    pub fn main_window(&self) -> Option<Arc<dyn MainWindow>> {
        self.harness.main_window()
    }

    pub fn assert_that(&self, condition: bool, reason: impl Into<String>) -> bool {
        self.harness.assert_that(condition, reason)
    }

    pub fn quit(&self) {
        self.harness.quit();
    }
}

/// Run one test against the application described by `collaborators`.
pub fn run_test<F>(
    test_id: &str,
    config: HarnessConfig,
    collaborators: Collaborators,
    body: F,
) -> HarnessResult<()>
where
    F: FnOnce(&TestContext) + Send + 'static,
{
    crate::logging::init();
    let workspace = SessionWorkspace::new()?;
    let launch = workspace.launch_config()?;
    tracing::info!(test_id, ui = collaborators.has_ui(), "test starting");

    let result = if collaborators.has_ui() {
        run_cooperative(test_id, config, collaborators, launch, body)
    } else {
        run_blocking(test_id, config, collaborators, launch, body)
    };
    match &result {
        Ok(()) => tracing::info!(test_id, "test passed"),
        Err(e) => tracing::warn!(test_id, error = %e, "test failed"),
    }
    result
}

fn run_blocking<F>(
    test_id: &str,
    config: HarnessConfig,
    collaborators: Collaborators,
    launch: LaunchConfig,
    body: F,
) -> HarnessResult<()>
where
    F: FnOnce(&TestContext) + Send + 'static,
{
    let harness = Harness::new(test_id, config, collaborators, None);
    harness.setup()?;

    let ready = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ready);
    let chain = standard_chain(&harness, launch);
    let on_ready = move || flag.store(true, Ordering::SeqCst);
    if let Err(e) = chain.run(&harness.bootstrap_poller(), on_ready) {
        return abort_setup(&harness, e);
    }

    let mut panic = None;
    if ready.load(Ordering::SeqCst) && !harness.is_quitting() {
        let ctx = TestContext {
            harness: harness.clone(),
        };
        panic = catch_unwind(AssertUnwindSafe(|| body(&ctx))).err();
    }
    finish(&harness, panic)
}

fn run_cooperative<F>(
    test_id: &str,
    config: HarnessConfig,
    collaborators: Collaborators,
    launch: LaunchConfig,
    body: F,
) -> HarnessResult<()>
where
    F: FnOnce(&TestContext) + Send + 'static,
{
    let mut event_loop = EventLoop::new();
    let ceiling = config.loop_ceiling;
    let harness = Harness::new(test_id, config, collaborators, Some(event_loop.handle()));
    harness.setup()?;

    let panic_slot: Arc<Mutex<Option<PanicPayload>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&panic_slot);
    let ctx = TestContext {
        harness: harness.clone(),
    };
    let on_ready = move || {
        if ctx.harness.is_quitting() {
            return;
        }
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
            *lock(&slot) = Some(payload);
            ctx.quit();
        }
    };
    let chain = standard_chain(&harness, launch);
    if let Err(e) = chain.run(&harness.bootstrap_poller(), on_ready) {
        return abort_setup(&harness, e);
    }

    if event_loop.run_until(ceiling) == LoopExit::CeilingReached {
        harness.record(
            FailureKind::Assertion,
            HarnessError::LoopDeadline { waited: ceiling }.to_string(),
        );
    }
    let panic = lock(&panic_slot).take();
    finish(&harness, panic)
}

/// Precondition or launch failed. A stale instance belongs to someone
/// else, so it is left alone; anything else still gets a teardown.
fn abort_setup(harness: &Harness, error: HarnessError) -> HarnessResult<()> {
    tracing::error!(test_id = %harness.test_id(), %error, "setup failed");
    if !matches!(error, HarnessError::StaleInstance) {
        if let Err(teardown) = harness.teardown() {
            tracing::warn!(error = %teardown, "teardown after failed setup also failed");
        }
    }
    Err(error)
}

fn finish(harness: &Harness, panic: Option<PanicPayload>) -> HarnessResult<()> {
    harness.check_background();
    let result = harness.teardown();
    if let Some(payload) = panic {
        if let Err(e) = &result {
            tracing::error!(error = %e, "teardown failed after the test body panicked");
        }
        resume_unwind(payload);
    }
    result
}
