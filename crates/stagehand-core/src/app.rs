//! Contracts for the application under test.
//!
//! Each trait is the narrowest view the harness needs of one external
//! collaborator. Implementations are expected to be cheap to query: the
//! poller calls predicates such as [`AppInstance::init_complete`] every
//! poll interval, possibly from the cooperative loop thread.
//!
//! # At most one instance
//!
//! The application keeps at most one live instance at a time. Instead of a
//! process global, that instance is reached through an explicit
//! [`AppRegistry`] handle that the harness hands to the bootstrap chain and
//! to teardown, so "exists", "get", and "remove" are visible operations.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::HarnessResult;

/// Settings handed to the application when it is launched.
#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    /// Directory where the application keeps its persistent state.
    pub state_dir: PathBuf,
    /// Directory where the application writes its output files.
    pub dest_dir: PathBuf,
    /// Free-form switches (feature toggles, ports) interpreted by the application.
    pub settings: Map<String, Value>,
}

impl LaunchConfig {
    /// Create a launch config rooted at the given directories.
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            dest_dir: dest_dir.into(),
            settings: Map::new(),
        }
    }

    /// Set a single application switch.
    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

/// Handle to the one live application instance (the background service).
pub trait AppInstance: Send + Sync {
    /// Whether the core service finished initializing.
    fn init_complete(&self) -> bool;

    /// Ask the service to shut down. Must not block.
    fn shutdown(&self);

    /// Whether a previously requested shutdown has completed.
    fn has_shutdown(&self) -> bool;

    /// Nested runtime statistics, dumped to the log on failure when enabled.
    fn statistics(&self) -> Value {
        Value::Null
    }
}

/// Registry owning the application's single-instance slot.
pub trait AppRegistry: Send + Sync {
    /// Start the application. The instance may appear later, on the
    /// application's own threads.
    fn launch(&self, config: &LaunchConfig) -> HarnessResult<()>;

    /// Whether an instance is currently registered.
    fn instance_exists(&self) -> bool;

    /// The registered instance, if any.
    fn instance(&self) -> Option<Arc<dyn AppInstance>>;

    /// Drop the registered instance. Tolerates an empty slot.
    fn remove_instance(&self);
}

/// The main window (frame) of the graphical front-end.
pub trait MainWindow: Send + Sync {
    /// Whether the window finished building itself.
    fn ready(&self) -> bool;

    /// Maximize the window.
    fn maximize(&self);

    /// Ask the window to close, running its close handlers.
    fn close(&self);
}

/// The UI controller that wires the front-end together.
pub trait UiController: Send + Sync {
    /// Whether the controller finished registering itself.
    fn registered(&self) -> bool;

    /// The main window, once the controller created it.
    fn main_window(&self) -> Option<Arc<dyn MainWindow>>;

    /// Close every dialog and secondary top-level window.
    fn close_secondary_windows(&self);

    /// Ask the front-end application object to exit.
    fn request_exit(&self);
}

/// Lookup for the UI controller singleton.
pub trait UiRegistry: Send + Sync {
    /// Whether a controller instance exists yet.
    fn controller_exists(&self) -> bool;

    /// The controller instance, if any.
    fn controller(&self) -> Option<Arc<dyn UiController>>;
}

/// Evidence capture (a screenshot in GUI mode).
pub trait DiagnosticCapture: Send + Sync {
    /// Capture the current state under the given label.
    fn capture(&self, label: &str);
}

/// Every collaborator the harness talks to, bundled for hand-off.
#[derive(Clone)]
pub struct Collaborators {
    /// The application's instance registry.
    pub app: Arc<dyn AppRegistry>,
    /// The UI controller lookup (GUI mode only).
    pub ui: Option<Arc<dyn UiRegistry>>,
    /// Diagnostic capture (GUI mode only).
    pub diagnostics: Option<Arc<dyn DiagnosticCapture>>,
}

impl Collaborators {
    /// Collaborators for a service without a graphical front-end.
    #[must_use]
    pub fn headless(app: Arc<dyn AppRegistry>) -> Self {
        Self {
            app,
            ui: None,
            diagnostics: None,
        }
    }

    /// Collaborators for a service with a graphical front-end.
    #[must_use]
    pub fn with_ui(
        app: Arc<dyn AppRegistry>,
        ui: Arc<dyn UiRegistry>,
        diagnostics: Arc<dyn DiagnosticCapture>,
    ) -> Self {
        Self {
            app,
            ui: Some(ui),
            diagnostics: Some(diagnostics),
        }
    }

    /// Whether a graphical front-end is under test.
    #[inline]
    pub fn has_ui(&self) -> bool {
        self.ui.is_some()
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("ui", &self.ui.is_some())
            .field("diagnostics", &self.diagnostics.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_config_collects_settings() {
        let config = LaunchConfig::new("/tmp/state", "/tmp/dest")
            .with_setting("dht", false)
            .with_setting("min_port", -1);
        assert_eq!(config.settings.get("dht"), Some(&Value::Bool(false)));
        assert_eq!(config.settings.get("min_port"), Some(&Value::from(-1)));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/state"));
    }
}
