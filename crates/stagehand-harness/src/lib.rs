#![forbid(unsafe_code)]

//! Stagehand harness: drive an application through bootstrap, a test body,
//! and a clean teardown.
//!
//! # Role in stagehand
//! `stagehand-harness` is the layer tests talk to. It wires the scheduler
//! and poller from `stagehand-runtime` to the application contracts in
//! `stagehand-core`, and owns everything around a single test: scratch
//! directories, the annotation log, failure capture, and the quiesce and
//! teardown sequence.
//!
//! # Key Components
//!
//! - [`run_test`] - The fixture: setup, bootstrap, body, teardown
//! - [`Harness`] - Per-test state; the failure reporter for every poll
//! - [`BootstrapChain`] / [`Stage`] - Ordered readiness waits
//! - [`HarnessConfig`] - Timeouts, delays, failure mode; env overrides
//! - [`AnnotationLog`] - Timestamped intervals in `annotations.txt`
//! - [`SessionWorkspace`] - Per-test temporary state and output directories
//! - [`logging::init`] - Subscriber setup driven by `STAGEHAND_LOG`
//!
//! # How it fits in the system
//! Tests construct [`Collaborators`](stagehand_core::Collaborators) for the
//! application under test (or the fakes in `stagehand_core::fake`) and pass
//! a body to [`run_test`]. Failures inside poll sessions never unwind; they
//! are recorded and replayed as
//! [`HarnessError::Assertions`](stagehand_core::HarnessError::Assertions)
//! when teardown finishes.

pub mod annotate;
pub mod bootstrap;
pub mod census;
pub mod config;
pub mod diagnostics;
pub mod fixture;
pub mod harness;
pub mod logging;
pub mod teardown;
pub mod workspace;

pub use annotate::{ANNOTATION_FILE, AnnotationLog, sanitize};
pub use bootstrap::{
    BootstrapChain, BootstrapProgress, STAGE_CONTROLLER, STAGE_INIT, STAGE_INSTANCE, STAGE_WINDOW,
    Stage, standard_chain,
};
pub use census::{ThreadInfo, thread_census};
pub use config::{CloseDelays, FailureMode, HarnessConfig};
pub use diagnostics::{LabelCapture, dump_statistics, next_capture_path, statistics_lines};
pub use fixture::{TestContext, run_test};
pub use harness::Harness;
pub use teardown::wait_for_shutdown;
pub use workspace::SessionWorkspace;
