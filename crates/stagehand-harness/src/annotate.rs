//! Annotation log: named, timestamped intervals appended to
//! `<output_dir>/annotations.txt`.
//!
//! File format (space separated, one interval per line):
//!
//! ```text
//! annotation start end
//! 1_test_abc 1700000000.25 1700000012.5
//! ```
//!
//! The numeric prefix is a process-wide counter so repeated annotations of
//! the same test stay distinguishable. Timestamps are wall-clock seconds
//! since the Unix epoch.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use stagehand_core::HarnessResult;

pub const ANNOTATION_FILE: &str = "annotations.txt";
const HEADER: &str = "annotation start end";

static NEXT_ANNOTATION: AtomicU64 = AtomicU64::new(1);

/// Replace every character outside `[A-Za-z0-9_]` with `_`.
pub fn sanitize(annotation: &str) -> String {
    annotation
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// Open intervals keyed by annotation text.
#[derive(Debug)]
pub struct AnnotationLog {
    dir: PathBuf,
    starts: HashMap<String, f64>,
}

impl AnnotationLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            starts: HashMap::new(),
        }
    }

    pub fn file_path(&self) -> PathBuf {
        self.dir.join(ANNOTATION_FILE)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record the start of `annotation`. Restarting replaces the old start.
    pub fn start(&mut self, annotation: &str) -> HarnessResult<()> {
        fs::create_dir_all(&self.dir)?;
        self.starts.insert(annotation.to_string(), epoch_secs());
        Ok(())
    }

    /// Close `annotation` and append its line. Returns `false` (writing
    /// nothing) when it was never started.
    pub fn finish(&mut self, annotation: &str) -> HarnessResult<bool> {
        let Some(start) = self.starts.remove(annotation) else {
            tracing::debug!(annotation, "finish without start; ignored");
            return Ok(false);
        };
        let end = epoch_secs();
        let nr = NEXT_ANNOTATION.fetch_add(1, Ordering::Relaxed);

        fs::create_dir_all(&self.dir)?;
        let path = self.file_path();
        let fresh = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if fresh {
            writeln!(file, "{HEADER}")?;
        }
        writeln!(file, "{nr}_{} {start} {end}", sanitize(annotation))?;
        tracing::trace!(annotation, nr, start, end, "annotation written");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitize_keeps_word_characters() {
        assert_eq!(sanitize("test_abc"), "test_abc");
        assert_eq!(sanitize("a.b c-d/é"), "a_b_c_d__");
    }

    #[test]
    fn finish_appends_header_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut log = AnnotationLog::new(tmp.path().join("out"));
        log.start("first test").unwrap();
        assert!(log.finish("first test").unwrap());
        log.start("second").unwrap();
        assert!(log.finish("second").unwrap());

        let text = fs::read_to_string(log.file_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);

        let fields: Vec<&str> = lines[1].split(' ').collect();
        assert_eq!(fields.len(), 3);
        assert!(fields[0].ends_with("_first_test"), "{}", fields[0]);
        let start: f64 = fields[1].parse().unwrap();
        let end: f64 = fields[2].parse().unwrap();
        assert!(end >= start);

        let first_nr: u64 = fields[0].split('_').next().unwrap().parse().unwrap();
        let second_nr: u64 = lines[2].split('_').next().unwrap().parse().unwrap();
        assert!(second_nr > first_nr);
    }

    #[test]
    fn finish_without_start_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let mut log = AnnotationLog::new(tmp.path());
        assert!(!log.finish("never started").unwrap());
        assert!(!log.file_path().exists());
    }
}
