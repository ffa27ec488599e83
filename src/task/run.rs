//! One-call orchestration of a checkpointed task run.

use std::future;
use std::sync::Arc;

use async_stream::stream;
use futures::stream::{self as futures_stream, BoxStream};
use futures::{Stream, StreamExt};
use tracing::{debug, info};

use super::checkpoint::CheckpointLog;
use super::policy::{TaskOverrides, TaskPolicy};
use super::processor::Processor;
use super::progress::{ProgressCounters, ProgressMonitor, DEFAULT_PROGRESS_INTERVAL};
use super::runner::TaskRunner;
use crate::error::TaskError;
use crate::types::Identifiable;

/// Stream of processed items produced by [`run_task`].
pub type OutputStream<T> = BoxStream<'static, Result<T, TaskError>>;

/// Runs `processor` over `items` and yields the transformed items.
///
/// See [`run_task_stream`].
pub fn run_task<T, I, P>(
    items: I,
    processor: Arc<P>,
    overrides: &TaskOverrides,
) -> Result<OutputStream<T>, TaskError>
where
    T: Identifiable + Send + Sync + 'static,
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
    P: Processor<T> + ?Sized + 'static,
{
    run_task_stream(futures_stream::iter(items), processor, overrides)
}

/// Runs `processor` over a stream of items and yields the transformed items.
///
/// The policy is resolved from the configuration context bound to the
/// caller, with `overrides` taking precedence. When a checkpoint path is
/// configured, items the checkpoint already records are skipped and each
/// successful item is recorded before it is yielded. Items the processor
/// drops are recorded but not yielded. Failures are either left out of the
/// output (and not recorded, so a later run retries them) or end the stream
/// with an error, depending on the policy.
pub fn run_task_stream<T, S, P>(
    items: S,
    processor: Arc<P>,
    overrides: &TaskOverrides,
) -> Result<OutputStream<T>, TaskError>
where
    T: Identifiable + Send + Sync + 'static,
    S: Stream<Item = T> + Send + 'static,
    P: Processor<T> + ?Sized + 'static,
{
    let policy = TaskPolicy::current(overrides)?;

    let checkpoint = match &policy.checkpoint_path {
        Some(path) => {
            let mut log = CheckpointLog::open(path, policy.checkpoint_flush_interval)?;
            if let Some(every) = policy.checkpoint_flush_every {
                log = log.with_flush_every(every);
            }
            Some(Arc::new(log))
        }
        None => None,
    };

    let total = match items.size_hint() {
        (lower, Some(upper)) if lower == upper => Some(lower),
        _ => None,
    };
    let counters = policy.show_progress.then(ProgressCounters::new);

    let filtered = match &checkpoint {
        Some(log) => {
            let log = Arc::clone(log);
            let counters = counters.clone();
            items
                .filter(move |item| {
                    let id = item.item_id();
                    let done = log.is_processed(&id);
                    if done {
                        debug!(item_id = %id, "Skipping checkpointed item");
                        if let Some(counters) = &counters {
                            counters.record_skipped();
                        }
                    }
                    future::ready(!done)
                })
                .boxed()
        }
        None => items.boxed(),
    };

    info!(
        workers = policy.max_workers,
        rate_limit = policy.rate_limit,
        ordered = policy.ordered_results,
        ignore_errors = policy.ignore_errors,
        checkpoint = ?policy.checkpoint_path,
        resumed = checkpoint.as_ref().map(|log| log.len()).unwrap_or(0),
        "Starting task run"
    );

    let mut runner = TaskRunner::new(processor, policy)?;
    if let Some(counters) = &counters {
        runner = runner.with_progress(counters.clone());
    }
    let mut results = runner.run_stream(filtered);

    Ok(Box::pin(stream! {
        let monitor = counters
            .map(|counters| ProgressMonitor::start(counters, total, DEFAULT_PROGRESS_INTERVAL));

        while let Some(result) = results.next().await {
            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            if !result.success {
                continue;
            }

            if let Some(log) = &checkpoint {
                if let Err(e) = log.save(&result.input.item_id()) {
                    yield Err(TaskError::from(e));
                    return;
                }
            }
            if let Some(output) = result.output {
                yield Ok(output);
            }
        }

        if let Some(log) = &checkpoint {
            if let Err(e) = log.flush() {
                yield Err(TaskError::from(e));
            }
        }
        if let Some(monitor) = monitor {
            monitor.stop();
        }
    }))
}
