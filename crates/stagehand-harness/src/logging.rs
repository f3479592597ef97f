#![forbid(unsafe_code)]

//! Subscriber installation for harness runs.
//!
//! The filter comes from `STAGEHAND_LOG`, then `RUST_LOG`, then `warn`.
//! `STAGEHAND_LOG_FORMAT=json` switches to one JSON object per event.
//! Output goes through the test writer so `cargo test` captures it per test.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the global subscriber. Safe to call from every test; only the
/// first call does anything, and an already-installed subscriber wins.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("STAGEHAND_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("warn"));

        let installed = if json_requested() {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_test_writer()
                .json()
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_test_writer()
                .with_thread_names(true)
                .try_init()
        };
        if installed.is_err() {
            tracing::debug!("global subscriber already installed; keeping it");
        }
    });
}

fn json_requested() -> bool {
    std::env::var("STAGEHAND_LOG_FORMAT").is_ok_and(|v| v.trim().eq_ignore_ascii_case("json"))
}
