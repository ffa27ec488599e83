//! Concurrent execution of a processor over a stream of items.
//!
//! A run spawns one feeder task and `max_workers` worker tasks into a
//! [`JoinSet`]:
//!
//! ```text
//! input stream ──► feeder ──► job queue ──► workers ──► results ──► output stream
//!                    ▲                                                  │
//!                    └────────────── window permits ◄───────────────────┘
//! ```
//!
//! The feeder takes one window permit per item and the permit is released
//! only when the item's result has been yielded, so at most
//! `2 × max_workers` items are in flight or waiting to be reordered. Workers
//! run with the configuration context of the caller that started the run.
//! Dropping the output stream aborts every task of the run.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use futures::stream::{self as futures_stream, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::limiter::RateLimiter;
use super::policy::TaskPolicy;
use super::processor::{Outcome, Processor};
use super::progress::ProgressCounters;
use super::result::{TaskMetadata, TaskResult};
use crate::config::{bind, config};
use crate::error::TaskError;
use crate::types::Identifiable;

/// Stream of per-item results produced by a run.
pub type ResultStream<T> = BoxStream<'static, Result<TaskResult<T>, TaskError>>;

struct Job<T> {
    index: usize,
    item: T,
    permit: OwnedSemaphorePermit,
}

struct Completed<T> {
    index: usize,
    result: Result<TaskResult<T>, TaskError>,
    permit: OwnedSemaphorePermit,
}

/// Runs a [`Processor`] over items with a fixed pool of workers.
pub struct TaskRunner<T, P: ?Sized> {
    processor: Arc<P>,
    policy: Arc<TaskPolicy>,
    limiter: Arc<RateLimiter>,
    progress: Option<ProgressCounters>,
    _item: std::marker::PhantomData<fn(T) -> T>,
}

impl<T, P> TaskRunner<T, P>
where
    T: Identifiable + Send + Sync + 'static,
    P: Processor<T> + ?Sized + 'static,
{
    /// Creates a runner; fails if the policy's rate limit is invalid.
    pub fn new(processor: Arc<P>, policy: TaskPolicy) -> Result<Self, TaskError> {
        let limiter = RateLimiter::new(policy.rate_limit)?;
        Ok(Self {
            processor,
            policy: Arc::new(policy),
            limiter: Arc::new(limiter),
            progress: None,
            _item: std::marker::PhantomData,
        })
    }

    /// Reports submissions and outcomes to `counters`.
    pub fn with_progress(mut self, counters: ProgressCounters) -> Self {
        self.progress = Some(counters);
        self
    }

    pub fn policy(&self) -> &TaskPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Convenience wrapper around [`run_stream`](Self::run_stream) for iterators.
    pub fn run_iter<I>(&self, items: I) -> ResultStream<T>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        self.run_stream(futures_stream::iter(items))
    }

    /// Processes `items` and yields one result per item.
    ///
    /// Results come in input order when the policy asks for ordered results
    /// and in completion order otherwise. Under a policy that does not ignore
    /// errors, the first failure is yielded as [`TaskError::Processing`] and
    /// the stream ends.
    ///
    /// The configuration context bound when this method is called is the one
    /// the workers see.
    pub fn run_stream<S>(&self, items: S) -> ResultStream<T>
    where
        S: Stream<Item = T> + Send + 'static,
    {
        let context = config().current();
        let processor = Arc::clone(&self.processor);
        let policy = Arc::clone(&self.policy);
        let limiter = Arc::clone(&self.limiter);
        let progress = self.progress.clone();

        Box::pin(stream! {
            let window = Arc::new(Semaphore::new(policy.window()));
            let (job_tx, job_rx) = mpsc::channel::<Job<T>>(policy.max_workers);
            let jobs = Arc::new(Mutex::new(job_rx));
            let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Completed<T>>();
            let mut tasks: JoinSet<Result<(), (usize, String)>> = JoinSet::new();

            tasks.spawn(bind(
                Arc::clone(&context),
                feed(items, job_tx, Arc::clone(&window), progress.clone()),
            ));

            for worker_id in 0..policy.max_workers {
                let worker = Worker {
                    id: worker_id,
                    processor: Arc::clone(&processor),
                    policy: Arc::clone(&policy),
                    limiter: Arc::clone(&limiter),
                    jobs: Arc::clone(&jobs),
                    results: result_tx.clone(),
                };
                tasks.spawn(bind(Arc::clone(&context), async move {
                    AssertUnwindSafe(worker.run())
                        .catch_unwind()
                        .await
                        .map_err(|panic| (worker_id, panic_message(&*panic)))
                }));
            }
            drop(result_tx);

            debug!(
                workers = policy.max_workers,
                rate_limit = policy.rate_limit,
                ordered = policy.ordered_results,
                context = %context.name(),
                "Task run started"
            );

            let mut reorder: BTreeMap<usize, (Result<TaskResult<T>, TaskError>, OwnedSemaphorePermit)> =
                BTreeMap::new();
            let mut next_index = 0usize;

            while let Some(done) = result_rx.recv().await {
                let fatal = done.result.is_err();
                if policy.ordered_results && !fatal {
                    reorder.insert(done.index, (done.result, done.permit));
                    while let Some((result, permit)) = reorder.remove(&next_index) {
                        next_index += 1;
                        record(progress.as_ref(), &result);
                        yield result;
                        drop(permit);
                    }
                } else {
                    record(progress.as_ref(), &done.result);
                    yield done.result;
                    drop(done.permit);
                    if fatal {
                        return;
                    }
                }
            }

            while let Some(joined) = tasks.join_next().await {
                let failure = match joined {
                    Ok(Ok(())) => continue,
                    Ok(Err((worker_id, message))) => (format!("worker-{worker_id}"), message),
                    Err(e) if e.is_cancelled() => continue,
                    Err(e) => ("feeder".to_string(), e.to_string()),
                };
                error!(worker = %failure.0, message = %failure.1, "Task worker terminated abnormally");
                yield Err(TaskError::WorkerFailed {
                    worker_id: failure.0,
                    message: failure.1,
                });
                return;
            }

            debug!("Task run finished");
        })
    }
}

/// Pulls items from the input and hands them to workers, respecting the window.
async fn feed<S, T>(
    items: S,
    jobs: mpsc::Sender<Job<T>>,
    window: Arc<Semaphore>,
    progress: Option<ProgressCounters>,
) -> Result<(), (usize, String)>
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
{
    let mut items = std::pin::pin!(items);
    let mut index = 0usize;

    while let Some(item) = items.next().await {
        let Ok(permit) = Arc::clone(&window).acquire_owned().await else {
            break;
        };
        if let Some(counters) = &progress {
            counters.record_submitted();
        }
        if jobs.send(Job { index, item, permit }).await.is_err() {
            break;
        }
        index += 1;
    }

    debug!(submitted = index, "Task input exhausted");
    Ok(())
}

struct Worker<T, P: ?Sized> {
    id: usize,
    processor: Arc<P>,
    policy: Arc<TaskPolicy>,
    limiter: Arc<RateLimiter>,
    jobs: Arc<Mutex<mpsc::Receiver<Job<T>>>>,
    results: mpsc::UnboundedSender<Completed<T>>,
}

impl<T, P> Worker<T, P>
where
    T: Identifiable + Send + Sync + 'static,
    P: Processor<T> + ?Sized + 'static,
{
    async fn run(self) {
        loop {
            let job = {
                let mut jobs = self.jobs.lock().await;
                jobs.recv().await
            };
            let Some(Job { index, item, permit }) = job else {
                break;
            };

            let result = self.execute(index, item).await;
            let completed = Completed {
                index,
                result,
                permit,
            };
            if self.results.send(completed).is_err() {
                break;
            }
        }
    }

    async fn execute(&self, index: usize, item: T) -> Result<TaskResult<T>, TaskError> {
        let started = Instant::now();
        let mut attempts = 0u32;

        let outcome = loop {
            attempts += 1;
            self.limiter.wait().await;

            let outcome = match AssertUnwindSafe(self.processor.process(&item))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => Outcome::failed(format!(
                    "processor panicked: {}",
                    panic_message(&*panic)
                )),
            };

            match outcome {
                Outcome::Failed(e) if attempts <= self.policy.max_retries => {
                    let delay = self.policy.retry_delay(attempts);
                    warn!(
                        worker_id = self.id,
                        index,
                        attempt = attempts,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Processor failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                outcome => break outcome,
            }
        };

        let metadata = TaskMetadata::new(index, self.id, attempts, started.elapsed());
        match outcome {
            Outcome::Kept(output) => Ok(TaskResult::success(item, output, metadata)),
            Outcome::Dropped => Ok(TaskResult::dropped(item, metadata)),
            Outcome::Failed(e) if self.policy.ignore_errors => {
                warn!(
                    worker_id = self.id,
                    index,
                    attempts,
                    processor = self.processor.name(),
                    error = %e,
                    "Item failed"
                );
                Ok(TaskResult::failure(item, format!("{e:#}"), metadata))
            }
            Outcome::Failed(e) => {
                let item_id = item.item_id();
                error!(
                    worker_id = self.id,
                    index,
                    item_id = %item_id,
                    attempts,
                    error = %e,
                    "Item failed, aborting run"
                );
                Err(TaskError::Processing {
                    item_id,
                    index,
                    error: e,
                })
            }
        }
    }
}

fn record<T>(progress: Option<&ProgressCounters>, result: &Result<TaskResult<T>, TaskError>) {
    let Some(counters) = progress else {
        return;
    };
    match result {
        Ok(r) if r.is_dropped() => counters.record_dropped(),
        Ok(r) if r.success => counters.record_succeeded(),
        _ => counters.record_failed(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
