//! Failure vocabulary shared by the poller, bootstrap, and teardown.
//!
//! Nothing inside the polling machinery propagates a raw error or panic to
//! the scheduler. Instead every problem becomes a [`Failure`] and is handed
//! to a [`FailureReporter`], which decides whether to quit, capture
//! diagnostics, and record it for replay at teardown.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Error type predicates and continuations may return.
pub type CheckError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What kind of problem a [`Failure`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// A poll session's predicate never held within its timeout.
    ConditionTimeout,
    /// A predicate or success continuation returned an error or panicked.
    ConditionRaised,
    /// A test-body assertion did not hold.
    Assertion,
    /// A task on the event loop panicked outside any poll session.
    BackgroundPanic,
    /// Teardown found timers or a global instance left behind.
    ResidualState,
}

impl FailureKind {
    /// Stable lowercase name, used as a structured log field.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConditionTimeout => "condition_timeout",
            Self::ConditionRaised => "condition_raised",
            Self::Assertion => "assertion",
            Self::BackgroundPanic => "background_panic",
            Self::ResidualState => "residual_state",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reported failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    /// Human-readable reason; what the test runner ultimately shows.
    pub message: String,
    /// Caller-supplied label (stage name, wait description).
    pub label: Option<String>,
    /// Short identifier of the test that was running.
    pub test_id: Option<String>,
    /// Time spent in the poll session before it resolved, when applicable.
    pub elapsed: Option<Duration>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            label: None,
            test_id: None,
            elapsed: None,
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_test_id(mut self, test_id: impl Into<String>) -> Self {
        self.test_id = Some(test_id.into());
        self
    }

    #[must_use]
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }

    /// The label, or the placeholder used when none was given.
    pub fn label_or_default(&self) -> &str {
        self.label.as_deref().unwrap_or("no-assert-msg")
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Sink for failures coming out of the polling machinery.
///
/// Implementations must be callable from any thread, including the
/// cooperative loop thread, and must not panic.
pub trait FailureReporter: Send + Sync {
    fn report(&self, failure: Failure);
}

/// Append-only, thread-safe record of failures.
///
/// Clones share the same record. Entries keep report order; nothing is
/// removed except by [`drain`](Self::drain), which teardown calls once.
#[derive(Debug, Clone, Default)]
pub struct FailureLog {
    entries: Arc<Mutex<Vec<Failure>>>,
}

impl FailureLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Failure>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, failure: Failure) {
        self.entries().push(failure);
    }

    /// Copy of every entry, oldest first.
    pub fn snapshot(&self) -> Vec<Failure> {
        self.entries().clone()
    }

    /// Remove and return every entry, oldest first.
    pub fn drain(&self) -> Vec<Failure> {
        std::mem::take(&mut *self.entries())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl FailureReporter for FailureLog {
    fn report(&self, failure: Failure) {
        self.push(failure);
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
