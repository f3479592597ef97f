//! Error type shared by every stagehand crate.

use std::fmt;
use std::time::Duration;

/// Errors surfaced by harness setup, teardown, and configuration.
///
/// Failures that happen *inside* a poll session are not errors: they are
/// reported as `Failure` values and only become a [`HarnessError::Assertions`]
/// when teardown replays them.
#[derive(Debug)]
pub enum HarnessError {
    /// An application instance was already registered before setup.
    StaleInstance,
    /// An operation required a live application instance and none existed.
    NoInstance,
    /// The application did not confirm shutdown within the ceiling.
    ShutdownTimeout {
        /// How long teardown waited before giving up.
        waited: Duration,
    },
    /// The cooperative loop ran past its ceiling without being asked to exit.
    LoopDeadline {
        /// How long the loop was allowed to run.
        waited: Duration,
    },
    /// Deferred assertion failures replayed at the end of teardown.
    Assertions(Vec<String>),
    /// I/O failure while writing harness artifacts.
    Io(std::io::Error),
    /// Invalid configuration value.
    Config(String),
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::StaleInstance => write!(
                f,
                "an application instance is already present when setting up the test"
            ),
            HarnessError::NoInstance => write!(f, "no application instance is registered"),
            HarnessError::ShutdownTimeout { waited } => write!(
                f,
                "application took too long to shut down (waited {:.1}s)",
                waited.as_secs_f64()
            ),
            HarnessError::LoopDeadline { waited } => write!(
                f,
                "event loop did not exit within {:.1}s",
                waited.as_secs_f64()
            ),
            HarnessError::Assertions(reasons) => {
                write!(f, "{} assertion(s) failed", reasons.len())?;
                for reason in reasons {
                    write!(f, "\n  - {reason}")?;
                }
                Ok(())
            }
            HarnessError::Io(e) => write!(f, "I/O error: {e}"),
            HarnessError::Config(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarnessError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HarnessError {
    fn from(e: std::io::Error) -> Self {
        HarnessError::Io(e)
    }
}

/// Result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;
