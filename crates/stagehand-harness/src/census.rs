//! Thread census taken at teardown, so threads leaked by a test show up
//! in the log next to the test that leaked them.

/// One live thread of this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: u64,
    pub name: String,
}

/// Live threads of this process, sorted by id. Empty where the platform
/// offers no cheap way to enumerate them.
pub fn thread_census() -> Vec<ThreadInfo> {
    #[cfg(target_os = "linux")]
    {
        let Ok(entries) = std::fs::read_dir("/proc/self/task") else {
            return Vec::new();
        };
        let mut threads: Vec<ThreadInfo> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let tid = entry.file_name().to_str()?.parse().ok()?;
                let name = std::fs::read_to_string(entry.path().join("comm"))
                    .map(|s| s.trim_end().to_string())
                    .unwrap_or_default();
                Some(ThreadInfo { tid, name })
            })
            .collect();
        threads.sort_by_key(|t| t.tid);
        threads
    }
    #[cfg(not(target_os = "linux"))]
    {
        Vec::new()
    }
}

pub fn log_census(threads: &[ThreadInfo]) {
    tracing::debug!(count = threads.len(), "threads alive at teardown");
    for thread in threads {
        tracing::debug!(tid = thread.tid, name = %thread.name, "thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn census_sees_a_named_thread() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let worker = std::thread::Builder::new()
            .name("census-probe".into())
            .spawn(move || {
                let _ = rx.recv();
            })
            .unwrap();

        let threads = thread_census();
        assert!(threads.len() >= 2);
        assert!(threads.iter().any(|t| t.name == "census-probe"));
        assert!(threads.windows(2).all(|w| w[0].tid < w[1].tid));

        tx.send(()).unwrap();
        worker.join().unwrap();
    }
}
