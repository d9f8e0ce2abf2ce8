//! Parallel fan-out/fan-in of independent extraction tasks.
//!
//! Tasks run on a bounded thread pool and report through a channel. The
//! caller waits for each completion with a bounded poll; what happens when a
//! poll runs out is set by [`TimeoutPolicy`].
//!
//! When aggregation ends early (a failure, a timeout, the deadline) queued
//! tasks that have not started are skipped. Tasks that are already running
//! are left to finish in the background and their results are discarded.

use crate::error::FanOutError;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What to do when a task does not finish in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Drop the late task's contribution and keep what finished.
    #[default]
    CollectFinished,

    /// Fail the whole aggregation.
    AllOrNothing,
}

/// Fan-out tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutConfig {
    /// Upper bound on each wait for the next finished task
    pub poll_timeout: Duration,

    /// Overall bound on the aggregation
    pub deadline: Option<Duration>,

    /// Items handled per worker thread when sizing the pool
    pub items_per_worker: usize,

    /// Cap on the pool size
    pub max_workers: usize,

    pub policy: TimeoutPolicy,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(60),
            deadline: None,
            items_per_worker: 10,
            max_workers: 32,
            policy: TimeoutPolicy::CollectFinished,
        }
    }
}

/// A unit of work producing part of the aggregate.
pub type Task<R, E> = Box<dyn FnOnce() -> Result<Vec<R>, E> + Send + 'static>;

/// Split `items` into consecutive batches of `batch_size`; the last batch
/// holds the remainder.
pub fn partition<T: Clone>(items: &[T], batch_size: usize) -> Vec<Vec<T>> {
    items.chunks(batch_size.max(1)).map(<[T]>::to_vec).collect()
}

/// Pool size for `item_count` items: one worker per `items_per_worker`,
/// at least one.
pub fn worker_count(item_count: usize, items_per_worker: usize) -> usize {
    (item_count / items_per_worker.max(1)).max(1)
}

/// Guard against scheduling the same logical item twice, shared by workers.
#[derive(Debug)]
pub struct SeenGuard<K: Eq + Hash> {
    seen: DashSet<K>,
}

impl<K: Eq + Hash> Default for SeenGuard<K> {
    fn default() -> Self {
        Self {
            seen: DashSet::new(),
        }
    }
}

impl<K: Eq + Hash> SeenGuard<K> {
    /// Create an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time `key` is claimed, `false` afterwards.
    pub fn claim(&self, key: K) -> bool {
        self.seen.insert(key)
    }

    /// Check whether `key` was claimed.
    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains(key)
    }

    /// Number of claimed keys.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Check whether nothing was claimed.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

enum Outcome<R, E> {
    Done(Result<Vec<R>, E>),
    Panicked,
}

/// Raises the abandonment flag when aggregation returns, on every path.
struct Abandon(Arc<AtomicBool>);

impl Drop for Abandon {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Bounded-concurrency executor for homogeneous tasks.
#[derive(Debug, Clone)]
pub struct FanOut {
    config: FanOutConfig,
    workers: usize,
}

impl FanOut {
    /// Create a fan-out sized by `config`.
    pub fn new(config: FanOutConfig) -> Self {
        Self {
            config,
            workers: 1,
        }
    }

    /// Size the pool for `item_count` items.
    pub fn for_items(config: FanOutConfig, item_count: usize) -> Self {
        let workers = worker_count(item_count, config.items_per_worker).min(config.max_workers.max(1));
        Self { config, workers }
    }

    /// Override the pool size.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Get the pool size.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Get the fan-out tuning.
    pub fn config(&self) -> &FanOutConfig {
        &self.config
    }

    /// Run all tasks and merge their results in completion order.
    ///
    /// The first task error or panic aborts the aggregation; nothing
    /// gathered so far is returned.
    pub fn execute<R, E>(&self, tasks: Vec<Task<R, E>>) -> Result<Vec<R>, FanOutError<E>>
    where
        R: Send + 'static,
        E: Send + 'static,
    {
        let total = tasks.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        tracing::debug!(tasks = total, workers = self.workers, "Starting fan-out");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("fan-out-{i}"))
            .build()
            .map_err(|e| FanOutError::Pool(e.to_string()))?;

        let abandoned = Arc::new(AtomicBool::new(false));
        let _abandon = Abandon(abandoned.clone());
        let (tx, rx) = mpsc::channel::<(usize, Outcome<R, E>)>();

        for (index, task) in tasks.into_iter().enumerate() {
            let tx = tx.clone();
            let abandoned = abandoned.clone();
            pool.spawn(move || {
                if abandoned.load(Ordering::SeqCst) {
                    return;
                }
                let outcome = match panic::catch_unwind(AssertUnwindSafe(task)) {
                    Ok(result) => Outcome::Done(result),
                    Err(_) => Outcome::Panicked,
                };
                // The receiver is gone once aggregation gave up on us.
                let _ = tx.send((index, outcome));
            });
        }
        drop(tx);

        let start = Instant::now();
        let mut results = Vec::new();
        let mut completed = 0;

        for _ in 0..total {
            let wait = match self.config.deadline {
                Some(deadline) => {
                    let left = deadline.saturating_sub(start.elapsed());
                    if left.is_zero() {
                        break;
                    }
                    left.min(self.config.poll_timeout)
                }
                None => self.config.poll_timeout,
            };

            match rx.recv_timeout(wait) {
                Ok((_, Outcome::Done(Ok(items)))) => {
                    completed += 1;
                    results.extend(items);
                }
                Ok((index, Outcome::Done(Err(source)))) => {
                    return Err(FanOutError::Task { index, source });
                }
                Ok((index, Outcome::Panicked)) => {
                    return Err(FanOutError::Panicked { index });
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.config.policy == TimeoutPolicy::AllOrNothing {
                        return Err(FanOutError::Timeout {
                            pending: total - completed,
                            waited: start.elapsed(),
                        });
                    }
                    tracing::warn!(waited_ms = wait.as_millis() as u64, "Fan-out poll timed out, dropping a task");
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let dropped = total - completed;
        if dropped > 0 {
            if self.config.policy == TimeoutPolicy::AllOrNothing {
                return Err(FanOutError::Timeout {
                    pending: dropped,
                    waited: start.elapsed(),
                });
            }
            tracing::warn!(dropped, completed, "Fan-out finished with dropped tasks");
        }

        tracing::debug!(
            completed,
            results = results.len(),
            total_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Fan-out completed"
        );

        Ok(results)
    }
}
