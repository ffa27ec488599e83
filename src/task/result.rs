//! Per-item results produced by the task runner.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Execution details recorded for one item.
#[derive(Debug, Clone, Serialize)]
pub struct TaskMetadata {
    /// Wall time from the first attempt to the final outcome, including retry backoff.
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Number of processor calls made.
    pub attempts: u32,
    /// Worker that produced the result.
    pub worker_id: usize,
    /// Zero-based position of the item in the input.
    pub index: usize,
    pub completed_at: DateTime<Utc>,
    /// Free-form values attached by the runner or callers.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl TaskMetadata {
    pub fn new(index: usize, worker_id: usize, attempts: u32, duration: Duration) -> Self {
        Self {
            duration,
            attempts,
            worker_id,
            index,
            completed_at: Utc::now(),
            extra: Map::new(),
        }
    }
}

/// The result of running one item through a processor.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult<T> {
    pub success: bool,
    pub input: T,
    /// Transformed item; `None` on failure or when the processor dropped it.
    pub output: Option<T>,
    /// Failure description; set only when `success` is false.
    pub error: Option<String>,
    pub metadata: TaskMetadata,
}

impl<T> TaskResult<T> {
    pub fn success(input: T, output: T, metadata: TaskMetadata) -> Self {
        Self {
            success: true,
            input,
            output: Some(output),
            error: None,
            metadata,
        }
    }

    /// A successful result whose item was intentionally filtered out.
    pub fn dropped(input: T, metadata: TaskMetadata) -> Self {
        Self {
            success: true,
            input,
            output: None,
            error: None,
            metadata,
        }
    }

    pub fn failure(input: T, error: impl Into<String>, metadata: TaskMetadata) -> Self {
        Self {
            success: false,
            input,
            output: None,
            error: Some(error.into()),
            metadata,
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.success && self.output.is_none()
    }

    pub fn index(&self) -> usize {
        self.metadata.index
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}
