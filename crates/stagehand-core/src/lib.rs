#![forbid(unsafe_code)]

//! Core: collaborator contracts, errors, and in-memory fakes for stagehand.
//!
//! The harness never reaches into the application under test directly. It
//! talks to it through the narrow traits in [`app`], which keeps the
//! polling and teardown machinery testable against [`fake`] doubles.

pub mod app;
pub mod error;
pub mod fake;

pub use app::{
    AppInstance, AppRegistry, Collaborators, DiagnosticCapture, LaunchConfig, MainWindow,
    UiController, UiRegistry,
};
pub use error::{HarnessError, HarnessResult};
