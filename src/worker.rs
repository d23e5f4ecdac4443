//! Named worker threads with bounded join

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A spawned loop thread
///
/// The thread holds the sending half of a zero-traffic channel; when the
/// thread returns the channel disconnects, which lets `join_timeout` wait
/// for exit without blocking forever on `JoinHandle::join`.
pub struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
    exited: Receiver<()>,
}

impl Worker {
    /// Spawn a named thread
    pub fn spawn<F>(name: impl Into<String>, f: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (exit_tx, exit_rx) = bounded::<()>(0);

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let _exit_guard = exit_tx;
            f();
        })?;

        Ok(Self {
            name,
            handle: Some(handle),
            exited: exit_rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait up to `timeout` for the thread to exit.
    ///
    /// Returns false if the thread is still running; it is then detached.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        match self.exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                if handle.join().is_err() {
                    tracing::warn!("Worker {} panicked", self.name);
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "Worker {} did not stop within {:?}, detaching",
                    self.name,
                    timeout
                );
                false
            }
        }
    }
}

/// Join every worker, each bounded by `timeout`. Returns how many were detached.
pub fn join_all(workers: Vec<Worker>, timeout: Duration) -> usize {
    workers
        .into_iter()
        .map(|w| w.join_timeout(timeout))
        .filter(|stopped| !stopped)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_join_finished_worker() {
        let worker = Worker::spawn("quick", || {}).unwrap();
        assert_eq!(worker.name(), "quick");
        assert!(worker.join_timeout(Duration::from_secs(1)));
    }

    #[test]
    fn test_hung_worker_is_detached_within_bound() {
        let release = Arc::new(AtomicBool::new(false));
        let release_thread = release.clone();
        let worker = Worker::spawn("hung", move || {
            while !release_thread.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

        let started = Instant::now();
        assert!(!worker.join_timeout(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(1));
        release.store(true, Ordering::Relaxed);
    }

    #[test]
    fn test_join_all_counts_detached() {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let workers = vec![
            Worker::spawn("a", || {}).unwrap(),
            Worker::spawn("b", move || {
                while !stop_thread.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap(),
        ];
        assert_eq!(join_all(workers, Duration::from_millis(30)), 1);
        stop.store(true, Ordering::Relaxed);
    }
}
