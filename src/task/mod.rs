//! Concurrent task execution engine.
//!
//! This module runs a [`Processor`] over a stream of items with a fixed pool
//! of workers:
//!
//! - **Rate limiting**: a token bucket shared by all workers of a run
//! - **Ordering**: results in input order or in completion order
//! - **Failure policy**: failed items become failed results, or end the run
//! - **Retries**: exponential backoff, every attempt re-admitted by the limiter
//! - **Checkpointing**: completed item ids are appended to a log so an
//!   interrupted run resumes where it stopped
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use convoforge::task::{run_task, LlmProcessor, TaskOverrides};
//! use convoforge::types::{Conversation, Message};
//! use futures::StreamExt;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let items = vec![Conversation::new(vec![Message::user("Explain ownership")])];
//! let overrides = TaskOverrides::new()
//!     .with_max_workers(8)
//!     .with_rate_limit(5.0)
//!     .with_checkpoint_path("run.ckpt");
//!
//! let mut outputs = run_task(items, Arc::new(LlmProcessor::new()), &overrides)?;
//! while let Some(conversation) = outputs.next().await {
//!     println!("{}", serde_json::to_string(&conversation?)?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod limiter;
pub mod policy;
pub mod processor;
pub mod processors;
pub mod progress;
pub mod result;
pub mod run;
pub mod runner;

pub use checkpoint::CheckpointLog;
pub use limiter::RateLimiter;
pub use policy::{TaskOverrides, TaskPolicy};
pub use processor::{processor_fn, FnProcessor, Outcome, Processor};
pub use processors::LlmProcessor;
pub use progress::{ProgressCounters, ProgressMonitor, ProgressSnapshot};
pub use result::{TaskMetadata, TaskResult};
pub use run::{run_task, run_task_stream, OutputStream};
pub use runner::{ResultStream, TaskRunner};
