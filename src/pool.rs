//! Fixed-lane worker pool with key-hash routing and bounded queues.
//!
//! Each lane is one OS thread consuming its own bounded channel. A job's
//! lane is `abs(routing_key) mod lane_count`, so callers that need
//! per-key ordering route related jobs to the same lane, while unrelated
//! keys (in practice: pseudo-random ones) spread across lanes. There is
//! no work stealing — a lane is a strictly sequential consumer.
//!
//! Submission is the backpressure mechanism: [`HashedWorkerPool::submit`]
//! gives up after a timeout and hands the job back, and the producer is
//! expected to retry. That keeps producers responsive instead of parked
//! forever on a full queue.
//!
//! Shutdown is cooperative: [`HashedWorkerPool::stop`] drops every lane
//! sender and joins the threads. A lane drains its queue to empty before
//! its receiver disconnects, so `stop` is a full barrier on all submitted
//! work.

use crossbeam_channel::{Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Per-lane counters, snapshotted by [`HashedWorkerPool::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneStats {
    /// Jobs currently waiting in the lane's queue.
    pub queued: usize,
    pub submitted: u64,
    pub processed: u64,
}

pub struct HashedWorkerPool<T: Send + 'static> {
    senders: Vec<Sender<T>>,
    submitted: Vec<Arc<AtomicU64>>,
    processed: Vec<Arc<AtomicU64>>,
    workers: Vec<JoinHandle<()>>,
}

/// Lane selection: `abs(key) mod lanes`. Deliberately simple and
/// deterministic — tests and affinity-sensitive callers rely on it.
pub(crate) fn lane_index(routing_key: i64, lane_count: usize) -> usize {
    (routing_key.unsigned_abs() % lane_count as u64) as usize
}

impl<T: Send + 'static> HashedWorkerPool<T> {
    /// Spawn `lane_count` worker threads, each with a bounded queue of
    /// `queue_depth` jobs, all running the same executor.
    pub fn new<F>(lane_count: usize, queue_depth: usize, execute: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        assert!(lane_count > 0, "pool needs at least one lane");
        let execute = Arc::new(execute);

        let mut senders = Vec::with_capacity(lane_count);
        let mut submitted = Vec::with_capacity(lane_count);
        let mut processed = Vec::with_capacity(lane_count);
        let mut workers = Vec::with_capacity(lane_count);

        for lane in 0..lane_count {
            let (tx, rx) = bounded::<T>(queue_depth);
            let done = Arc::new(AtomicU64::new(0));
            let execute = Arc::clone(&execute);
            let lane_done = Arc::clone(&done);
            let handle = std::thread::Builder::new()
                .name(format!("pool-lane-{lane}"))
                .spawn(move || {
                    // Runs until every sender is gone and the queue is
                    // drained; that disconnect is the stop signal.
                    while let Ok(job) = rx.recv() {
                        execute(job);
                        lane_done.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .expect("spawn pool lane");

            senders.push(tx);
            submitted.push(Arc::new(AtomicU64::new(0)));
            processed.push(done);
            workers.push(handle);
        }

        Self {
            senders,
            submitted,
            processed,
            workers,
        }
    }

    pub fn lane_count(&self) -> usize {
        self.senders.len()
    }

    /// Try to enqueue `payload` on the lane selected by `routing_key`.
    ///
    /// If the lane's queue stays full for the whole `timeout` the payload
    /// comes back in `Err` so the caller can retry it. That rejection is
    /// backpressure, not an error.
    pub fn submit(&self, routing_key: i64, payload: T, timeout: Duration) -> Result<(), T> {
        let lane = lane_index(routing_key, self.senders.len());
        match self.senders[lane].send_timeout(payload, timeout) {
            Ok(()) => {
                self.submitted[lane].fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => Err(err.into_inner()),
        }
    }

    /// Per-lane queue depth and counters. Observability only; values may
    /// be instantly stale.
    pub fn stats(&self) -> Vec<LaneStats> {
        self.senders
            .iter()
            .zip(&self.submitted)
            .zip(&self.processed)
            .map(|((tx, submitted), processed)| LaneStats {
                queued: tx.len(),
                submitted: submitted.load(Ordering::Relaxed),
                processed: processed.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Signal every lane to finish and block until all queued and
    /// in-flight jobs have executed. Returns the final per-lane stats.
    pub fn stop(self) -> Vec<LaneStats> {
        let stats_src = (self.submitted, self.processed);
        drop(self.senders);
        for handle in self.workers {
            let _ = handle.join();
        }
        stats_src
            .0
            .iter()
            .zip(&stats_src.1)
            .map(|(submitted, processed)| LaneStats {
                queued: 0,
                submitted: submitted.load(Ordering::Relaxed),
                processed: processed.load(Ordering::Relaxed),
            })
            .collect()
    }
}
