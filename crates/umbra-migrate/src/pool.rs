//! Bounded background worker pool for shadow-side work.
//!
//! Every mirrored operation and read comparison runs here, off the
//! caller's request path. The pool is sized by
//! [`PoolConfig`](crate::config::PoolConfig) and enforces backpressure by
//! **dropping the oldest pending job** when the queue is full: fresh
//! shadow traffic is worth more than stale shadow traffic, and the backfill
//! will repair anything a dropped write missed. An evicted or never-run job
//! is told so through [`PoolJob::abandon`], which is where it records its
//! failure.
//!
//! Submission never blocks and never fails the caller; that is the point.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::metrics::MigrationMetrics;

/// A unit of shadow-side work.
///
/// Jobs own everything they need to run (backend handle, payload, retry
/// policy, metrics), so the pool itself stays ignorant of migration
/// semantics.
#[async_trait]
pub trait PoolJob: Send + 'static {
    /// Runs the job to completion. Jobs handle their own retries and
    /// record their own outcomes; the pool never inspects results.
    async fn run(self: Box<Self>);

    /// Called instead of [`run`](Self::run) when the job is evicted by
    /// backpressure or the pool shut down before reaching it. The job
    /// records the loss here.
    fn abandon(self: Box<Self>);
}

/// Outcome of submitting a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The job was queued.
    Submitted,
    /// The job was queued and the oldest pending job was evicted to make
    /// room.
    DroppedOldest,
    /// The pool is closed; the job was abandoned immediately.
    Closed,
}

struct PoolState {
    queue: VecDeque<Box<dyn PoolJob>>,
    in_flight: usize,
    closed: bool,
}

struct PoolInner {
    capacity: usize,
    state: Mutex<PoolState>,
    /// Wakes one idle worker when a job arrives.
    work: Notify,
    /// Wakes `quiesce` callers when the pool drains.
    idle: Notify,
    metrics: Arc<MigrationMetrics>,
}

impl PoolInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // Queue state is a plain VecDeque plus counters; it stays
        // consistent even if a holder panicked mid-push.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded worker pool with drop-oldest backpressure.
pub struct ShadowPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ShadowPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowPool")
            .field("capacity", &self.inner.capacity)
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

impl ShadowPool {
    /// Starts the pool and its worker tasks.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(config: &PoolConfig, metrics: Arc<MigrationMetrics>) -> Self {
        let inner = Arc::new(PoolInner {
            capacity: config.queue_capacity.max(1),
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                in_flight: 0,
                closed: false,
            }),
            work: Notify::new(),
            idle: Notify::new(),
            metrics,
        });

        let workers = (0..config.workers.max(1))
            .map(|_| tokio::spawn(Self::worker_loop(Arc::clone(&inner))))
            .collect();

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    async fn worker_loop(inner: Arc<PoolInner>) {
        loop {
            let notified = inner.work.notified();
            tokio::pin!(notified);
            // Register for wakeups before re-checking the queue, so a job
            // submitted between the check and the await is not missed.
            notified.as_mut().enable();

            let job = {
                let mut state = inner.lock();
                match state.queue.pop_front() {
                    Some(job) => {
                        state.in_flight += 1;
                        inner.metrics.set_pool_queue_depth(state.queue.len());
                        Some(job)
                    }
                    None if state.closed => break,
                    None => None,
                }
            };

            match job {
                Some(job) => {
                    job.run().await;
                    let idle = {
                        let mut state = inner.lock();
                        state.in_flight -= 1;
                        state.queue.is_empty() && state.in_flight == 0
                    };
                    if idle {
                        inner.idle.notify_waiters();
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Submits a job, evicting the oldest pending job if the queue is at
    /// capacity. Never blocks.
    pub fn submit(&self, job: Box<dyn PoolJob>) -> SubmitOutcome {
        let (evicted, outcome) = {
            let mut state = self.inner.lock();
            if state.closed {
                drop(state);
                job.abandon();
                return SubmitOutcome::Closed;
            }
            state.queue.push_back(job);
            let evicted = if state.queue.len() > self.inner.capacity {
                state.queue.pop_front()
            } else {
                None
            };
            self.inner.metrics.set_pool_queue_depth(state.queue.len());
            let outcome = if evicted.is_some() {
                SubmitOutcome::DroppedOldest
            } else {
                SubmitOutcome::Submitted
            };
            (evicted, outcome)
        };

        if let Some(old) = evicted {
            self.inner.metrics.record_pool_dropped();
            old.abandon();
        }
        self.inner.work.notify_one();
        outcome
    }

    /// Number of jobs waiting in the queue (not counting in-flight jobs).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Waits until the queue is empty and no job is in flight.
    ///
    /// Intended for tests and for drain points in the orchestrator; new
    /// submissions arriving during the wait extend it.
    pub async fn quiesce(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.lock();
                if state.queue.is_empty() && state.in_flight == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Stops accepting new jobs. Queued jobs still run; workers exit once
    /// the queue drains.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.work.notify_waiters();
    }

    /// Closes the pool and waits for the workers to finish the remaining
    /// queue.
    pub async fn shutdown(&self) {
        self.close();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
