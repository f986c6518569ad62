//! Bounded file-processing queue drained by a pool of worker threads.

use ahash::AHashSet;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_QUEUE_CAPACITY: usize = 8192;

type InFlight = Arc<Mutex<AHashSet<PathBuf>>>;

pub struct FileQueue {
    tx: Option<Sender<PathBuf>>,
    in_flight: InFlight,
    handles: Vec<JoinHandle<()>>,
}

/// Worker count used when none is configured: half the cores, 1 to 8.
pub fn default_workers() -> usize {
    (num_cpus::get() / 2).clamp(1, 8)
}

impl FileQueue {
    /// Start `workers` threads (0 picks [`default_workers`]) that call
    /// `handler` for each submitted path until the queue is shut down or
    /// `running` is cleared.
    pub fn spawn<F>(
        workers: usize,
        capacity: usize,
        running: Arc<AtomicBool>,
        handler: F,
    ) -> io::Result<Self>
    where
        F: Fn(&Path) + Send + Sync + 'static,
    {
        let workers = if workers == 0 {
            default_workers()
        } else {
            workers
        };
        let (tx, rx) = crossbeam_channel::bounded::<PathBuf>(capacity.max(1));
        let in_flight: InFlight = Arc::new(Mutex::new(AHashSet::new()));
        let handler = Arc::new(handler);

        tracing::info!(workers, capacity, "starting file queue");

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let rx = rx.clone();
            let in_flight = in_flight.clone();
            let running = running.clone();
            let handler = handler.clone();
            let handle = thread::Builder::new()
                .name(format!("ss-file-{}", id))
                .spawn(move || run(id, rx, &in_flight, &running, &*handler))?;
            handles.push(handle);
        }

        Ok(FileQueue {
            tx: Some(tx),
            in_flight,
            handles,
        })
    }

    /// Queue `path`, blocking while the queue is full. Returns `false` if the
    /// path is already queued or being processed, or the queue is closed.
    pub fn submit(&self, path: PathBuf) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if !in_flight.insert(path.clone()) {
                tracing::trace!(file = %path.display(), "already queued");
                return false;
            }
        }
        match tx.send(path) {
            Ok(()) => true,
            Err(e) => {
                let path = e.into_inner();
                self.in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&path);
                false
            }
        }
    }

    /// Paths queued or in progress.
    pub fn pending(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Close the queue and wait for the workers. Paths already queued are
    /// still processed unless the running flag was cleared.
    pub fn shutdown(mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("file worker panicked");
            }
        }
    }
}

fn run(
    id: usize,
    rx: Receiver<PathBuf>,
    in_flight: &Mutex<AHashSet<PathBuf>>,
    running: &AtomicBool,
    handler: &dyn Fn(&Path),
) {
    while running.load(Ordering::Relaxed) {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(path) => {
                handler(&path);
                in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&path);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!(worker = id, "file worker shut down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn every_path_is_handled_once() {
        let running = Arc::new(AtomicBool::new(true));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let queue = FileQueue::spawn(3, 16, running, move |p: &Path| {
            sink.lock().unwrap().push(p.to_path_buf());
        })
        .unwrap();

        for i in 0..10 {
            assert!(queue.submit(PathBuf::from(format!("{}.pcap", i))));
        }
        queue.shutdown();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen.len(), 10);
        seen.dedup();
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn duplicate_in_flight_submission_is_ignored() {
        let running = Arc::new(AtomicBool::new(true));
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let queue = FileQueue::spawn(1, 4, running, move |_: &Path| {
            let _ = gate_rx.recv();
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(queue.submit(PathBuf::from("a.pcap")));
        assert!(!queue.submit(PathBuf::from("a.pcap")));
        assert_eq!(queue.pending(), 1);
        gate_tx.send(()).unwrap();
        drop(gate_tx);
        queue.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleared_running_flag_stops_workers() {
        let running = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let queue = FileQueue::spawn(2, 4, running, move |_: &Path| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        queue.submit(PathBuf::from("late.pcap"));
        queue.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
