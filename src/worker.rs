// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded worker pool for CPU-bound bulk work (fingerprinting, parsing).
//!
//! Jobs go through a bounded queue: when every worker is busy and the queue
//! is full, [`WorkerPool::submit`] waits. That is the backpressure: a large
//! sync can never pile up unbounded work in memory.
//!
//! Each job runs on Tokio's blocking thread pool so it never stalls the async
//! executor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{DataLayerError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queued: Arc<AtomicUsize>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `workers` worker tasks sharing a queue of `queue_capacity` jobs.
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let queued = Arc::new(AtomicUsize::new(0));

        let handles = (0..workers)
            .map(|worker| {
                let rx = rx.clone();
                let queued = queued.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        let depth = queued.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
                        crate::metrics::set_worker_queue_depth(depth);

                        let start = Instant::now();
                        match tokio::task::spawn_blocking(job).await {
                            Ok(()) => crate::metrics::record_worker_job("success", start.elapsed()),
                            Err(e) => {
                                warn!(worker, error = %e, "Worker job panicked");
                                crate::metrics::record_worker_job("panic", start.elapsed());
                            }
                        }
                    }
                    debug!(worker, "Worker stopped");
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            queued,
            size: workers,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs waiting for a worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Run `f` on a worker and wait for its result. Waits for queue space first.
    pub async fn submit<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| DataLayerError::WorkerPool("worker pool is shut down".to_string()))?;

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = tx.send(f());
        });

        self.queued.fetch_add(1, Ordering::AcqRel);
        if sender.send(job).await.is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(DataLayerError::WorkerPool("worker pool is shut down".to_string()));
        }

        rx.await
            .map_err(|_| DataLayerError::WorkerPool("job panicked before producing a result".to_string()))
    }

    /// Split `items` into batches of `batch_size`, map every item on the
    /// workers and return the results in input order.
    pub async fn map_batches<T, R, F>(&self, items: Vec<T>, batch_size: usize, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let batch_size = batch_size.max(1);
        let mut iter = items.into_iter();
        let mut jobs = Vec::new();
        loop {
            let batch: Vec<T> = iter.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            let f = f.clone();
            jobs.push(self.submit(move || batch.into_iter().map(|item| f(item)).collect::<Vec<R>>()));
        }

        let batches = try_join_all(jobs).await?;
        Ok(batches.into_iter().flatten().collect())
    }

    /// Stop accepting jobs, let queued jobs finish, and wait for the workers.
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
    }
}
