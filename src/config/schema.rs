//! Configuration snapshot types.
//!
//! A [`Settings`] value is an immutable, nested snapshot made of one struct
//! per section plus a free-form `extra` map. Snapshots are never mutated in
//! place once shared; new snapshots are derived through
//! [`Settings::derive`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::overrides::ConfigOverrides;
use crate::error::ConfigError;

/// Names of the leaf sections of [`Settings`], in declaration order.
pub const SECTION_NAMES: [&str; 6] = ["api", "http", "proc", "file", "task", "ds"];

/// Name of the free-form extension section.
pub const EXTRA_SECTION: &str = "extra";

/// A leaf section of [`Settings`].
///
/// Implemented by every section struct so that overrides can address a
/// section by name and replace or merge it without runtime reflection.
pub trait Section:
    Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
    /// Key of this section inside [`Settings`].
    const NAME: &'static str;

    /// Mutable access to this section inside a snapshot.
    fn slot(settings: &mut Settings) -> &mut Self;
}

/// API access settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of a local Ollama server.
    pub ollama_base_url: String,
    /// Base URL of an OpenAI-compatible API.
    pub openai_base_url: String,
    /// API key sent as a bearer token.
    pub openai_api_key: String,
    /// Model used by the LLM processor when none is given explicitly.
    pub model: String,
    /// Request timeout for LLM calls, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            ollama_base_url: "http://localhost:11434".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: String::new(),
            model: "gpt-3.5-turbo".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// One step of a path into a JSON document: an object key or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

/// Defaults for HTTP sources and sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub url: String,
    pub method: String,
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub json_data: Option<Value>,
    /// Location of the record list inside the response body.
    pub data_path: Vec<PathSegment>,
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            json_data: None,
            data_path: Vec::new(),
            timeout_secs: 30,
        }
    }
}

/// General processing defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub batch_size: usize,
    pub seed: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            seed: 42,
        }
    }
}

/// Defaults for file sources and sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub path: Option<PathBuf>,
    pub format: String,
    pub encoding: String,
    pub indent: Option<usize>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: None,
            format: "jsonl".to_string(),
            encoding: "utf-8".to_string(),
            indent: None,
        }
    }
}

/// Task-execution policy defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Number of concurrent workers per run.
    pub max_workers: usize,
    /// Requests-per-second ceiling; `0.0` disables limiting.
    pub rate_limit: f64,
    /// Emit results in input order instead of completion order.
    pub ordered_results: bool,
    /// Additional attempts after a failed processor call.
    pub max_retries: u32,
    /// Base delay of the exponential retry backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Turn processor failures into failed results instead of aborting.
    pub ignore_errors: bool,
    /// Checkpoint log location; checkpointing is off when unset.
    pub checkpoint_path: Option<PathBuf>,
    /// Number of buffered ids that triggers a checkpoint append.
    pub checkpoint_flush_interval: usize,
    /// Maximum age of buffered ids before an append, in seconds.
    pub checkpoint_flush_secs: Option<u64>,
    /// Log progress while a run is active.
    pub show_progress: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            rate_limit: 0.0,
            ordered_results: true,
            max_retries: 0,
            retry_base_delay_ms: 500,
            ignore_errors: true,
            checkpoint_path: None,
            checkpoint_flush_interval: 1,
            checkpoint_flush_secs: None,
            show_progress: false,
        }
    }
}

/// Dataset-level defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetDefaults {
    /// Mapping from canonical roles to format-specific role names.
    pub role_map: BTreeMap<String, String>,
    pub format: String,
}

impl Default for DatasetDefaults {
    fn default() -> Self {
        let role_map = [("user", "human"), ("assistant", "gpt"), ("system", "system")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            role_map,
            format: "jsonl".to_string(),
        }
    }
}

macro_rules! impl_section {
    ($ty:ty, $name:literal, $field:ident) => {
        impl Section for $ty {
            const NAME: &'static str = $name;

            fn slot(settings: &mut Settings) -> &mut Self {
                &mut settings.$field
            }
        }
    };
}

impl_section!(ApiConfig, "api", api);
impl_section!(HttpConfig, "http", http);
impl_section!(ProcessingConfig, "proc", proc);
impl_section!(FileConfig, "file", file);
impl_section!(TaskConfig, "task", task);
impl_section!(DatasetDefaults, "ds", ds);

/// A complete configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api: ApiConfig,
    pub http: HttpConfig,
    pub proc: ProcessingConfig,
    pub file: FileConfig,
    pub task: TaskConfig,
    pub ds: DatasetDefaults,
    /// Values for keys that no section declares.
    pub extra: Map<String, Value>,
}

impl Settings {
    /// Creates a snapshot with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a new snapshot with `overrides` applied.
    ///
    /// `self` is left untouched; sections not named by an override are
    /// copied as-is.
    pub fn derive(&self, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        overrides.apply(self)
    }

    /// Loads a snapshot from a YAML or JSON file.
    ///
    /// Missing sections and fields take their default values. The format is
    /// chosen by extension; anything but `.json` is parsed as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)?,
            _ => serde_yaml::from_str(&raw)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Creates a snapshot from defaults plus environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `OPENAI_API_KEY`: API key for the LLM processor
    /// - `OPENAI_BASE_URL`: Base URL of the OpenAI-compatible API
    /// - `CONVOFORGE_MODEL`: Default model
    /// - `CONVOFORGE_MAX_WORKERS`: Worker count (default: 4)
    /// - `CONVOFORGE_RATE_LIMIT`: Requests per second, 0 disables (default: 0)
    /// - `CONVOFORGE_ORDERED`: Emit results in input order (default: true)
    /// - `CONVOFORGE_MAX_RETRIES`: Retries per item (default: 0)
    /// - `CONVOFORGE_IGNORE_ERRORS`: Tolerate processor failures (default: true)
    /// - `CONVOFORGE_CHECKPOINT_PATH`: Checkpoint log path (default: unset)
    /// - `CONVOFORGE_CHECKPOINT_FLUSH_INTERVAL`: Ids per append (default: 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Ok(val) = std::env::var("OPENAI_API_KEY") {
            settings.api.openai_api_key = val;
        }

        if let Ok(val) = std::env::var("OPENAI_BASE_URL") {
            settings.api.openai_base_url = val;
        }

        if let Ok(val) = std::env::var("CONVOFORGE_MODEL") {
            settings.api.model = val;
        }

        if let Ok(val) = std::env::var("CONVOFORGE_MAX_WORKERS") {
            settings.task.max_workers = parse_env_value(&val, "CONVOFORGE_MAX_WORKERS")?;
        }

        if let Ok(val) = std::env::var("CONVOFORGE_RATE_LIMIT") {
            settings.task.rate_limit = parse_env_value(&val, "CONVOFORGE_RATE_LIMIT")?;
        }

        if let Ok(val) = std::env::var("CONVOFORGE_ORDERED") {
            settings.task.ordered_results = parse_env_bool(&val, "CONVOFORGE_ORDERED")?;
        }

        if let Ok(val) = std::env::var("CONVOFORGE_MAX_RETRIES") {
            settings.task.max_retries = parse_env_value(&val, "CONVOFORGE_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("CONVOFORGE_IGNORE_ERRORS") {
            settings.task.ignore_errors = parse_env_bool(&val, "CONVOFORGE_IGNORE_ERRORS")?;
        }

        if let Ok(val) = std::env::var("CONVOFORGE_CHECKPOINT_PATH") {
            settings.task.checkpoint_path = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("CONVOFORGE_CHECKPOINT_FLUSH_INTERVAL") {
            settings.task.checkpoint_flush_interval =
                parse_env_value(&val, "CONVOFORGE_CHECKPOINT_FLUSH_INTERVAL")?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "task.max_workers must be greater than 0".to_string(),
            ));
        }

        if !self.task.rate_limit.is_finite() || self.task.rate_limit < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "task.rate_limit must be a finite, non-negative number".to_string(),
            ));
        }

        if self.task.checkpoint_flush_interval == 0 {
            return Err(ConfigError::ValidationFailed(
                "task.checkpoint_flush_interval must be greater than 0".to_string(),
            ));
        }

        if self.api.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "api.request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parses an environment variable value into the specified type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses a boolean environment variable.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{}'", value),
        }),
    }
}
