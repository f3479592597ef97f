//! Harness configuration.
//!
//! Defaults mirror the timings the harness was tuned for: 30 s per
//! bootstrap stage, half-second polling, a 60 s shutdown ceiling. Every
//! knob can be overridden from the environment so CI can stretch timeouts
//! without recompiling.
//!
//! | Env var | Field |
//! |---------|-------|
//! | `OUTPUT_DIR` | `output_dir` |
//! | `STAGEHAND_STAGE_TIMEOUT_SECS` | `stage_timeout` |
//! | `STAGEHAND_POLL_INTERVAL_SECS` | `poll_interval` |
//! | `STAGEHAND_MIN_SETTLE_SECS` | `min_settle` |
//! | `STAGEHAND_SHUTDOWN_CEILING_SECS` | `shutdown_ceiling` |
//! | `STAGEHAND_SHUTDOWN_POLL_SECS` | `shutdown_poll` |
//! | `STAGEHAND_SETTLE_DELAY_SECS` | `settle_delay` |
//! | `STAGEHAND_LOOP_CEILING_SECS` | `loop_ceiling` |
//! | `STAGEHAND_FAILURE_MODE` | `failure_mode` (`fatal` / `soft`) |
//! | `STAGEHAND_ANNOTATE` | `annotate` |
//! | `STAGEHAND_DUMP_STATISTICS` | `dump_statistics` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use stagehand_core::{HarnessError, HarnessResult};

/// How the harness treats a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Capture diagnostics, quit, and replay the failure at teardown.
    #[default]
    Fatal,
    /// Capture diagnostics and keep a note; the test keeps running and
    /// teardown does not fail because of it.
    Soft,
}

impl FromStr for FailureMode {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fatal" => Ok(Self::Fatal),
            "soft" => Ok(Self::Soft),
            other => Err(HarnessError::Config(format!(
                "unknown failure mode {other:?} (expected \"fatal\" or \"soft\")"
            ))),
        }
    }
}

/// Delays used when closing the graphical front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseDelays {
    /// Before closing dialogs and secondary windows.
    pub secondary_windows: Duration,
    /// Before asking the application and loop to exit.
    pub loop_exit: Duration,
}

impl Default for CloseDelays {
    fn default() -> Self {
        Self {
            secondary_windows: Duration::from_secs(1),
            loop_exit: Duration::from_secs(2),
        }
    }
}

/// Configuration for one harness instance.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub output_dir: PathBuf,
    pub stage_timeout: Duration,
    pub poll_interval: Duration,
    /// Minimum total bootstrap time before the test body runs.
    /// `None` picks the mode default (see [`effective_min_settle`](Self::effective_min_settle)).
    pub min_settle: Option<Duration>,
    pub shutdown_ceiling: Duration,
    pub shutdown_poll: Duration,
    /// Pause before the thread census, letting worker threads wind down.
    pub settle_delay: Duration,
    pub close_delays: CloseDelays,
    /// Upper bound on one cooperative loop run.
    pub loop_ceiling: Duration,
    pub failure_mode: FailureMode,
    pub annotate: bool,
    pub dump_statistics: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            stage_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            min_settle: None,
            shutdown_ceiling: Duration::from_secs(60),
            shutdown_poll: Duration::from_secs(1),
            settle_delay: Duration::from_secs(1),
            close_delays: CloseDelays::default(),
            loop_ceiling: Duration::from_secs(300),
            failure_mode: FailureMode::Fatal,
            annotate: true,
            dump_statistics: false,
        }
    }
}

impl HarnessConfig {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> HarnessResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> HarnessResult<Self> {
        let mut config = Self::default();
        if let Some(dir) = lookup("OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(d) = secs(&lookup, "STAGEHAND_STAGE_TIMEOUT_SECS")? {
            config.stage_timeout = d;
        }
        if let Some(d) = secs(&lookup, "STAGEHAND_POLL_INTERVAL_SECS")? {
            config.poll_interval = d;
        }
        if let Some(d) = secs(&lookup, "STAGEHAND_MIN_SETTLE_SECS")? {
            config.min_settle = Some(d);
        }
        if let Some(d) = secs(&lookup, "STAGEHAND_SHUTDOWN_CEILING_SECS")? {
            config.shutdown_ceiling = d;
        }
        if let Some(d) = secs(&lookup, "STAGEHAND_SHUTDOWN_POLL_SECS")? {
            config.shutdown_poll = d;
        }
        if let Some(d) = secs(&lookup, "STAGEHAND_SETTLE_DELAY_SECS")? {
            config.settle_delay = d;
        }
        if let Some(d) = secs(&lookup, "STAGEHAND_LOOP_CEILING_SECS")? {
            config.loop_ceiling = d;
        }
        if let Some(mode) = lookup("STAGEHAND_FAILURE_MODE") {
            config.failure_mode = mode.parse()?;
        }
        if let Some(b) = flag(&lookup, "STAGEHAND_ANNOTATE")? {
            config.annotate = b;
        }
        if let Some(b) = flag(&lookup, "STAGEHAND_DUMP_STATISTICS")? {
            config.dump_statistics = b;
        }
        if config.poll_interval.is_zero() {
            return Err(HarnessError::Config(
                "STAGEHAND_POLL_INTERVAL_SECS must be greater than zero".into(),
            ));
        }
        Ok(config)
    }

    /// Settle floor for the given mode: 5 s with a UI, none without.
    pub fn effective_min_settle(&self, has_ui: bool) -> Duration {
        self.min_settle.unwrap_or(if has_ui {
            Duration::from_secs(5)
        } else {
            Duration::ZERO
        })
    }

    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_min_settle(mut self, floor: Duration) -> Self {
        self.min_settle = Some(floor);
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, ceiling: Duration, poll: Duration) -> Self {
        self.shutdown_ceiling = ceiling;
        self.shutdown_poll = poll;
        self
    }

    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    #[must_use]
    pub fn with_close_delays(mut self, secondary_windows: Duration, loop_exit: Duration) -> Self {
        self.close_delays = CloseDelays {
            secondary_windows,
            loop_exit,
        };
        self
    }

    #[must_use]
    pub fn with_loop_ceiling(mut self, ceiling: Duration) -> Self {
        self.loop_ceiling = ceiling;
        self
    }

    #[must_use]
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    #[must_use]
    pub fn with_annotate(mut self, annotate: bool) -> Self {
        self.annotate = annotate;
        self
    }

    #[must_use]
    pub fn with_dump_statistics(mut self, dump: bool) -> Self {
        self.dump_statistics = dump;
        self
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> HarnessResult<Option<Duration>> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| HarnessError::Config(format!("{name}={raw:?} is not a number of seconds")))?;
    Duration::try_from_secs_f64(value)
        .map(Some)
        .map_err(|_| HarnessError::Config(format!("{name}={raw:?} is out of range")))
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> HarnessResult<Option<bool>> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(HarnessError::Config(format!("{name}={raw:?} is not a boolean"))),
    }
}
