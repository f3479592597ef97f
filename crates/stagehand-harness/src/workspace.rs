//! Per-test scratch directories.
//!
//! Every test gets a fresh temporary root holding numbered state and output
//! directories; the whole tree is removed when the workspace drops.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use stagehand_core::LaunchConfig;
use tempfile::TempDir;

const STATE_DIR: &str = "dot.state";
const DEST_DIR: &str = "downloads";

#[derive(Debug)]
pub struct SessionWorkspace {
    root: TempDir,
}

impl SessionWorkspace {
    pub fn new() -> io::Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("stagehand-")
            .suffix("-session")
            .tempdir()?;
        tracing::debug!(root = %root.path().display(), "session workspace created");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// State directory for session `nr`; session 0 has no numeric suffix.
    pub fn state_dir(&self, nr: usize) -> io::Result<PathBuf> {
        self.numbered(STATE_DIR, nr)
    }

    /// Output directory for session `nr`.
    pub fn dest_dir(&self, nr: usize) -> io::Result<PathBuf> {
        self.numbered(DEST_DIR, nr)
    }

    /// Launch config pointing the application at session 0's directories.
    pub fn launch_config(&self) -> io::Result<LaunchConfig> {
        Ok(LaunchConfig::new(self.state_dir(0)?, self.dest_dir(0)?))
    }

    fn numbered(&self, base: &str, nr: usize) -> io::Result<PathBuf> {
        let name = if nr == 0 {
            base.to_string()
        } else {
            format!("{base}{nr}")
        };
        let path = self.root.path().join(name);
        fs::create_dir_all(&path)?;
        Ok(path)
    }
}
