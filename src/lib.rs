//! convoforge: concurrent task execution for LLM conversation datasets.
//!
//! This library runs a user-supplied [`task::Processor`] over a stream of
//! conversations with a fixed worker pool, a shared rate limit, ordered or
//! unordered output, and a checkpoint log for resuming interrupted runs.
//! Run parameters come from a scoped configuration store whose active
//! context follows each logical flow, including into worker tasks.

pub mod cli;
pub mod config;
pub mod error;
pub mod task;
pub mod types;

// Re-export commonly used types
pub use config::{config, ConfigOverrides, Settings};
pub use error::{CheckpointError, ConfigError, LimiterError, LlmError, ProcessError, TaskError};
pub use task::{run_task, run_task_stream, Outcome, Processor, TaskOverrides, TaskResult};
pub use types::{Conversation, Identifiable, Message};
