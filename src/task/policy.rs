//! Resolution of the execution policy for one run.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{config, TaskConfig};
use crate::error::ConfigError;

/// Per-call overrides of the task policy.
///
/// Unset fields fall back to the `task` section of the active configuration
/// context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOverrides {
    pub max_workers: Option<usize>,
    pub rate_limit: Option<f64>,
    pub ordered_results: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_base_delay: Option<Duration>,
    pub ignore_errors: Option<bool>,
    /// `Some(None)` disables checkpointing even if the context configures it.
    pub checkpoint_path: Option<Option<PathBuf>>,
    pub checkpoint_flush_interval: Option<usize>,
    pub checkpoint_flush_every: Option<Option<Duration>>,
    pub show_progress: Option<bool>,
}

impl TaskOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers);
        self
    }

    /// Sets the requests-per-second ceiling; `0.0` disables limiting.
    pub fn with_rate_limit(mut self, rate: f64) -> Self {
        self.rate_limit = Some(rate);
        self
    }

    pub fn with_ordered_results(mut self, ordered: bool) -> Self {
        self.ordered_results = Some(ordered);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = Some(delay);
        self
    }

    pub fn with_ignore_errors(mut self, ignore: bool) -> Self {
        self.ignore_errors = Some(ignore);
        self
    }

    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(Some(path.into()));
        self
    }

    pub fn without_checkpoint(mut self) -> Self {
        self.checkpoint_path = Some(None);
        self
    }

    pub fn with_checkpoint_flush_interval(mut self, interval: usize) -> Self {
        self.checkpoint_flush_interval = Some(interval);
        self
    }

    pub fn with_checkpoint_flush_every(mut self, every: Duration) -> Self {
        self.checkpoint_flush_every = Some(Some(every));
        self
    }

    pub fn with_show_progress(mut self, show: bool) -> Self {
        self.show_progress = Some(show);
        self
    }
}

/// The resolved, immutable policy of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPolicy {
    pub max_workers: usize,
    pub rate_limit: f64,
    pub ordered_results: bool,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub ignore_errors: bool,
    pub checkpoint_path: Option<PathBuf>,
    pub checkpoint_flush_interval: usize,
    pub checkpoint_flush_every: Option<Duration>,
    pub show_progress: bool,
}

impl TaskPolicy {
    /// Applies `overrides` on top of a `task` configuration section.
    pub fn resolve(base: &TaskConfig, overrides: &TaskOverrides) -> Result<Self, ConfigError> {
        let policy = Self {
            max_workers: overrides.max_workers.unwrap_or(base.max_workers),
            rate_limit: overrides.rate_limit.unwrap_or(base.rate_limit),
            ordered_results: overrides.ordered_results.unwrap_or(base.ordered_results),
            max_retries: overrides.max_retries.unwrap_or(base.max_retries),
            retry_base_delay: overrides
                .retry_base_delay
                .unwrap_or(Duration::from_millis(base.retry_base_delay_ms)),
            ignore_errors: overrides.ignore_errors.unwrap_or(base.ignore_errors),
            checkpoint_path: overrides
                .checkpoint_path
                .clone()
                .unwrap_or_else(|| base.checkpoint_path.clone()),
            checkpoint_flush_interval: overrides
                .checkpoint_flush_interval
                .unwrap_or(base.checkpoint_flush_interval),
            checkpoint_flush_every: overrides
                .checkpoint_flush_every
                .unwrap_or(base.checkpoint_flush_secs.map(Duration::from_secs)),
            show_progress: overrides.show_progress.unwrap_or(base.show_progress),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Resolves against the context bound to the calling task.
    pub fn current(overrides: &TaskOverrides) -> Result<Self, ConfigError> {
        let settings = config().settings();
        Self::resolve(&settings.task, overrides)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if !self.rate_limit.is_finite() || self.rate_limit < 0.0 {
            return Err(ConfigError::ValidationFailed(format!(
                "rate_limit must be a finite, non-negative number, got {}",
                self.rate_limit
            )));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_base_delay.saturating_mul(1u32 << exponent)
    }

    /// Results buffered or in flight at once.
    pub fn window(&self) -> usize {
        self.max_workers.saturating_mul(2)
    }
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self::resolve(&TaskConfig::default(), &TaskOverrides::default())
            .expect("default task config is valid")
    }
}
