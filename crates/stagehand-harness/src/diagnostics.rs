//! Failure evidence: capture file naming and the statistics dump.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use stagehand_core::DiagnosticCapture;

/// First `Screenshot-NN.<ext>` in `dir` that does not exist yet.
pub fn next_capture_path(dir: &Path, ext: &str) -> PathBuf {
    let mut index = 1usize;
    loop {
        let candidate = dir.join(format!("Screenshot-{index:02}.{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        index += 1;
    }
}

/// Capture that writes each label to the next free `Screenshot-NN.txt`.
///
/// Stands in for a real screen grabber on front-ends that cannot render
/// one; the numbering matches so evidence from both sorts the same way.
#[derive(Debug, Clone)]
pub struct LabelCapture {
    dir: PathBuf,
}

impl LabelCapture {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DiagnosticCapture for LabelCapture {
    fn capture(&self, label: &str) {
        let written = fs::create_dir_all(&self.dir).and_then(|()| {
            let path = next_capture_path(&self.dir, "txt");
            fs::write(&path, format!("{label}\n")).map(|()| path)
        });
        match written {
            Ok(path) => tracing::debug!(path = %path.display(), label, "diagnostic captured"),
            Err(e) => tracing::warn!(error = %e, label, "could not write diagnostic capture"),
        }
    }
}

/// Render a statistics tree as indented lines.
///
/// Nested objects print their key and recurse one level deeper; strings
/// print `key: value`. Numbers, booleans, arrays and nulls are skipped.
pub fn statistics_lines(stats: &Value) -> Vec<String> {
    let mut lines = Vec::new();
    if let Value::Object(map) = stats {
        walk(map, 0, &mut lines);
    }
    lines
}

fn walk(map: &serde_json::Map<String, Value>, depth: usize, out: &mut Vec<String>) {
    let indent = "-".repeat(1 + 2 * depth);
    for (key, value) in map {
        match value {
            Value::Object(inner) => {
                out.push(format!("{indent} {key}:"));
                walk(inner, depth + 1, out);
            }
            Value::String(s) => out.push(format!("{indent} {key}: {s}")),
            _ => {}
        }
    }
}

/// Log the statistics tree between begin/end markers.
pub fn dump_statistics(stats: &Value) {
    tracing::warn!("----- START DUMP STATISTICS -----");
    for line in statistics_lines(stats) {
        tracing::warn!("{line}");
    }
    tracing::warn!("----- END DUMP STATISTICS -----");
}
