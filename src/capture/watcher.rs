//! Directory watcher feeding capture files to the file queue.
//!
//! Files already in the directory are queued first. New files (created, or
//! renamed into the directory) are queued once no event has touched them for
//! the settle delay, so a capture still being written is not read early.

use super::engine::CaptureError;
use super::is_capture_file;
use crate::pipeline::FileQueue;
use ahash::AHashMap;
use notify::event::ModifyKind;
use notify::{EventKind, RecursiveMode, Watcher};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub const DEFAULT_SETTLE: Duration = Duration::from_secs(1);

/// Paths waiting for their events to stop.
#[derive(Debug, Default)]
pub struct Settler {
    settle: Duration,
    waiting: AHashMap<PathBuf, Instant>,
}

impl Settler {
    pub fn new(settle: Duration) -> Self {
        Settler {
            settle,
            waiting: AHashMap::new(),
        }
    }

    /// A new capture file appeared.
    pub fn add(&mut self, path: PathBuf, now: Instant) {
        self.waiting.insert(path, now);
    }

    /// The file was written to. Only restarts the delay of known paths.
    pub fn touch(&mut self, path: &Path, now: Instant) {
        if let Some(at) = self.waiting.get_mut(path) {
            *at = now;
        }
    }

    pub fn remove(&mut self, path: &Path) {
        self.waiting.remove(path);
    }

    /// Remove and return the paths quiet for the settle delay.
    pub fn ready(&mut self, now: Instant) -> Vec<PathBuf> {
        let settle = self.settle;
        let mut ready: Vec<PathBuf> = self
            .waiting
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= settle)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &ready {
            self.waiting.remove(path);
        }
        ready.sort();
        ready
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

/// Capture files currently in `dir`, sorted by name.
pub fn existing_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_capture_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Watch `dir` until `running` is cleared, submitting capture files to
/// `queue`. The directory is created if missing.
pub fn watch(
    dir: &Path,
    settle: Duration,
    queue: &FileQueue,
    running: &AtomicBool,
) -> Result<(), CaptureError> {
    fs::create_dir_all(dir)?;

    let (tx, rx) = crossbeam_channel::unbounded::<notify::Result<notify::Event>>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let _ = tx.send(res);
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;

    let existing = existing_files(dir)?;
    tracing::info!(dir = %dir.display(), existing = existing.len(), "watching for capture files");
    for path in existing {
        queue.submit(path);
    }

    let mut settler = Settler::new(settle);
    let poll = Duration::from_millis(100).min(settle.max(Duration::from_millis(1)));
    while running.load(Ordering::Relaxed) {
        match rx.recv_timeout(poll) {
            Ok(Ok(event)) => {
                let now = Instant::now();
                for path in event.paths.iter().filter(|p| is_capture_file(p)) {
                    match event.kind {
                        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                            if path.exists() {
                                settler.add(path.clone(), now);
                            } else {
                                settler.remove(path);
                            }
                        }
                        EventKind::Modify(_) => settler.touch(path, now),
                        EventKind::Remove(_) => settler.remove(path),
                        _ => {}
                    }
                }
            }
            Ok(Err(e)) => tracing::warn!(dir = %dir.display(), error = %e, "watch error"),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }

        for path in settler.ready(Instant::now()) {
            tracing::debug!(file = %path.display(), "new capture file");
            queue.submit(path);
        }
    }

    tracing::debug!(dir = %dir.display(), pending = settler.len(), "watcher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_ready_after_quiet_period() {
        let mut s = Settler::new(Duration::from_secs(1));
        let t0 = Instant::now();
        s.add(PathBuf::from("a.pcap"), t0);
        assert!(s.ready(t0 + Duration::from_millis(500)).is_empty());

        // A write restarts the delay.
        s.touch(Path::new("a.pcap"), t0 + Duration::from_millis(800));
        assert!(s.ready(t0 + Duration::from_millis(1500)).is_empty());
        assert_eq!(s.ready(t0 + Duration::from_millis(1800)), vec![PathBuf::from("a.pcap")]);
        assert!(s.is_empty());
    }

    #[test]
    fn touch_ignores_unknown_paths() {
        let mut s = Settler::new(Duration::from_secs(1));
        s.touch(Path::new("b.pcap"), Instant::now());
        assert!(s.is_empty());
    }

    #[test]
    fn existing_files_are_filtered_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.pcap", "a.pcapng", "notes.txt", "c.pcap.part"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("sub.pcap")).unwrap();

        let files = existing_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, ["a.pcapng", "b.pcap"]);
    }
}
