//! Per-reader asynchronous writer.
//!
//! Every reader owns one `AsyncWriter`: a bounded queue of closures
//! drained by a dedicated worker task. The publisher's write path only
//! ever enqueues, so a stalled reader can back up nothing but its own
//! queue. On overflow the writer drops the newest job, latches a
//! terminal errored state and surfaces [`CoreError::QueueOverflow`]
//! exactly once through the error channel; the owning session must then
//! tear itself down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};

type Job = Box<dyn FnOnce() + Send>;

/// Single-producer single-consumer bounded job queue with a dedicated
/// worker and drop-newest overflow semantics.
pub struct AsyncWriter {
    tx: mpsc::Sender<Job>,
    rx: Mutex<Option<mpsc::Receiver<Job>>>,
    stop: CancellationToken,
    errored: AtomicBool,
    err_tx: watch::Sender<Option<CoreError>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncWriter {
    /// Creates a writer with the given queue capacity. The capacity is
    /// fixed for the writer's lifetime; the configuration layer enforces
    /// that it is a power of two.
    pub fn new(queue_size: usize) -> Self {
        debug_assert!(queue_size.is_power_of_two());

        let (tx, rx) = mpsc::channel(queue_size);
        let (err_tx, _) = watch::channel(None);

        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            stop: CancellationToken::new(),
            errored: AtomicBool::new(false),
            err_tx,
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker task. Jobs pushed before `start` sit in the
    /// queue until it runs. Calling `start` twice is a no-op.
    pub fn start(&self) {
        let Some(mut rx) = self.rx.lock().expect("writer lock poisoned").take() else {
            return;
        };
        let stop = self.stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    job = rx.recv() => match job {
                        Some(job) => job(),
                        None => break,
                    },
                    _ = stop.cancelled() => {
                        // Best-effort drain before exiting.
                        while let Ok(job) = rx.try_recv() {
                            job();
                        }
                        break;
                    }
                }
            }
        });

        *self.worker.lock().expect("writer lock poisoned") = Some(handle);
    }

    /// Enqueues a job. Non-blocking; on a full queue the job is dropped,
    /// the writer latches its errored state and the call returns
    /// [`CoreError::QueueOverflow`]. Pushing after `stop` is a silent
    /// no-op. Jobs must not block: they are expected to hand the unit to
    /// the session and return.
    pub fn push(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.errored.load(Ordering::Acquire) {
            return Err(CoreError::QueueOverflow);
        }

        match self.tx.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                if !self.errored.swap(true, Ordering::AcqRel) {
                    let _ = self.err_tx.send(Some(CoreError::QueueOverflow));
                }
                Err(CoreError::QueueOverflow)
            }
            Err(TrySendError::Closed(_)) => Ok(()),
        }
    }

    /// Whether the writer has overflowed.
    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::Acquire)
    }

    /// The error channel. Holds `None` until the writer errors; the
    /// terminal error is published exactly once.
    pub fn error(&self) -> watch::Receiver<Option<CoreError>> {
        self.err_tx.subscribe()
    }

    /// Stops the worker: drains the queue best-effort and joins the
    /// task. Idempotent.
    pub async fn stop(&self) {
        self.stop.cancel();
        let worker = self.worker.lock().expect("writer lock poisoned").take();
        if let Some(handle) = worker {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for AsyncWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncWriter")
            .field("capacity", &self.tx.max_capacity())
            .field("errored", &self.is_errored())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn test_jobs_run_in_push_order() {
        let writer = AsyncWriter::new(16);
        writer.start();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = seen.clone();
            writer.push(move || seen.lock().unwrap().push(i)).unwrap();
        }

        // A sentinel job marks the queue as fully drained.
        let (tx, rx) = oneshot::channel();
        writer.push(move || drop(tx.send(()))).unwrap();
        rx.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        writer.stop().await;
    }

    #[tokio::test]
    async fn test_overflow_latches_and_surfaces_once() {
        // Never started: jobs accumulate.
        let writer = AsyncWriter::new(4);
        let mut err_rx = writer.error();
        assert!(err_rx.borrow().is_none());

        for _ in 0..4 {
            writer.push(|| {}).unwrap();
        }

        assert_eq!(writer.push(|| {}).unwrap_err(), CoreError::QueueOverflow);
        assert!(writer.is_errored());

        err_rx.changed().await.unwrap();
        assert_eq!(*err_rx.borrow(), Some(CoreError::QueueOverflow));

        // Still errored; no second notification is produced.
        assert_eq!(writer.push(|| {}).unwrap_err(), CoreError::QueueOverflow);
        assert!(!err_rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_stop_drains_pending_jobs() {
        let writer = AsyncWriter::new(16);

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let count = count.clone();
            writer
                .push(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        // Start and immediately stop: the drain still executes everything.
        writer.start();
        writer.stop().await;

        assert_eq!(count.load(Ordering::SeqCst), 8);

        // Pushing after stop is a silent no-op.
        assert!(writer.push(|| {}).is_ok());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let writer = AsyncWriter::new(4);
        writer.start();
        writer.stop().await;
        writer.stop().await;
    }
}
