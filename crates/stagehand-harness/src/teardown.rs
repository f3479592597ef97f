//! Teardown: quiesce, shut the service down, check for leftovers, and
//! replay deferred failures.
//!
//! Order:
//!
//! 1. quit (abort pending polls, close the front-end)
//! 2. close the test's annotation
//! 3. ask the service to shut down; wait up to the ceiling, polling
//! 4. drop application handles, pause, log the thread census
//! 5. flag leftover timers, background panics, or a registered instance
//! 6. return the shutdown timeout if there was one (logging the deferred
//!    failures), else the replayed failures
//!
//! Every step runs even when an earlier one failed. A second teardown finds
//! nothing left to do and succeeds.

use std::thread;
use std::time::{Duration, Instant};

use stagehand_core::{AppInstance, HarnessError, HarnessResult};
use stagehand_runtime::FailureKind;

use crate::census::{log_census, thread_census};
use crate::harness::{AppHandles, Harness, lock};

/// Ask `instance` to shut down and wait for it, checking every `poll`.
pub fn wait_for_shutdown(
    instance: &dyn AppInstance,
    ceiling: Duration,
    poll: Duration,
) -> HarnessResult<Duration> {
    let started = Instant::now();
    instance.shutdown();
    loop {
        let waited = started.elapsed();
        if instance.has_shutdown() {
            tracing::debug!(waited_ms = waited.as_millis() as u64, "application has shut down");
            return Ok(waited);
        }
        if waited >= ceiling {
            tracing::error!(waited_ms = waited.as_millis() as u64, "application did not shut down");
            return Err(HarnessError::ShutdownTimeout { waited });
        }
        tracing::debug!(
            remaining_s = (ceiling - waited).as_secs_f64(),
            "waiting for application to shut down"
        );
        thread::sleep(poll.min(ceiling - waited));
    }
}

impl Harness {
    /// Tear the test down. See the module docs for the order of steps.
    pub fn teardown(&self) -> HarnessResult<()> {
        let span = tracing::debug_span!("teardown", test_id = %self.test_id());
        let _guard = span.enter();

        self.quit();
        self.check_background();
        self.close_annotation();

        let shutdown = self.shutdown_service();

        *self.handles() = AppHandles::default();
        let config = self.config();
        if !config.settle_delay.is_zero() {
            thread::sleep(config.settle_delay);
        }
        log_census(&thread_census());

        self.check_residual_state();

        let failures = self.inner.failures.drain();
        if let Err(e) = shutdown {
            for failure in &failures {
                tracing::warn!(kind = %failure.kind, "{}", failure.message);
            }
            return Err(e);
        }
        if failures.is_empty() {
            tracing::debug!("teardown clean");
            return Ok(());
        }
        Err(HarnessError::Assertions(
            failures.into_iter().map(|f| f.message).collect(),
        ))
    }

    fn close_annotation(&self) {
        if !self.config().annotate {
            return;
        }
        if let Err(e) = lock(&self.inner.annotations).finish(self.test_id()) {
            tracing::warn!(error = %e, "could not write annotation");
        }
    }

    fn shutdown_service(&self) -> HarnessResult<()> {
        let app = &self.collaborators().app;
        let Some(instance) = self.instance().or_else(|| app.instance()) else {
            tracing::debug!("no application instance; nothing to shut down");
            return Ok(());
        };
        let config = self.config();
        wait_for_shutdown(instance.as_ref(), config.shutdown_ceiling, config.shutdown_poll)?;
        app.remove_instance();
        Ok(())
    }

    fn check_residual_state(&self) {
        if let Some(handle) = self.loop_handle() {
            let pending = handle.pending_timers();
            if pending > 0 {
                self.record(
                    FailureKind::ResidualState,
                    format!("The event loop was dirty when tearing down the test ({pending} pending timers)"),
                );
                handle.cancel_pending();
            }
        }
        self.check_background();
        if self.collaborators().app.instance_exists() {
            self.record(
                FailureKind::ResidualState,
                "An application instance is still present when tearing down the test".into(),
            );
        }
    }
}
