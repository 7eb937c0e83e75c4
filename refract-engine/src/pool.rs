//! Bounded handler worker pool.
//!
//! `N` workers drain a FIFO queue of capacity `2N`; submission is
//! non-blocking and reports overflow to the dispatcher, which degrades
//! the event instead of back-pressuring the paused-event stream. With
//! `N = 0` every event runs on its own task (unbounded; meant for tests).

use futures::future::BoxFuture;
use refract_common::PoolStats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Job = BoxFuture<'static, ()>;

const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

pub struct WorkerPool {
    tx: Option<mpsc::Sender<Job>>,
    queue_cap: usize,
    workers: usize,
    submitted: AtomicU64,
    dropped: AtomicU64,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Start the workers and the periodic monitor. The pool stops when
    /// `parent` is cancelled or [`WorkerPool::shutdown`] is called.
    pub fn new(workers: usize, parent: &CancellationToken) -> Arc<Self> {
        let cancel = parent.child_token();

        if workers == 0 {
            debug!("worker pool unbounded, one task per event");
            return Arc::new(Self {
                tx: None,
                queue_cap: 0,
                workers: 0,
                submitted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                cancel,
            });
        }

        let queue_cap = workers * 2;
        let (tx, rx) = mpsc::channel::<Job>(queue_cap);
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers {
            let rx = rx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            job = guard.recv() => job,
                        }
                    };
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
                debug!(worker, "pool worker stopped");
            });
        }

        let pool = Arc::new(Self {
            tx: Some(tx),
            queue_cap,
            workers,
            submitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            cancel: cancel.clone(),
        });
        info!(workers, queue_cap, "worker pool started");

        let monitor = pool.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(MONITOR_INTERVAL) => {
                        let stats = monitor.stats();
                        if stats.submitted > 0 {
                            info!(
                                queue_len = stats.queue_len,
                                queue_cap = stats.queue_cap,
                                usage = format!("{:.1}%", stats.usage() * 100.0),
                                submitted = stats.submitted,
                                dropped = stats.dropped,
                                drop_rate = format!("{:.2}%", stats.drop_rate() * 100.0),
                                "worker pool status"
                            );
                        }
                    }
                }
            }
        });

        pool
    }

    /// Non-blocking submit. `false` means the queue is full and the job
    /// was not accepted.
    pub fn submit(&self, job: Job) -> bool {
        let Some(tx) = &self.tx else {
            tokio::spawn(job);
            return true;
        };

        self.submitted.fetch_add(1, Ordering::Relaxed);
        match tx.try_send(job) {
            Ok(()) => true,
            Err(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    queue_cap = self.queue_cap,
                    dropped, "worker pool queue full, task dropped"
                );
                false
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let queue_len = self
            .tx
            .as_ref()
            .map(|tx| self.queue_cap.saturating_sub(tx.capacity()))
            .unwrap_or(0);
        PoolStats {
            queue_len,
            queue_cap: self.queue_cap,
            submitted: self.submitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Stop workers and the monitor. Queued jobs are abandoned.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
