//! Scoped configuration store.
//!
//! Configuration lives in immutable [`Settings`] snapshots wrapped in
//! identified [`ConfigContext`]s. A [`ConfigManager`] keeps a registry of
//! contexts and tracks which one is active for each logical flow.
//!
//! # Example
//!
//! ```rust,ignore
//! use convoforge::config::{config, ConfigOverrides, ContextRef};
//!
//! let overrides = ConfigOverrides::new()
//!     .set("rate_limit", 5.0)
//!     .set("api.openai_api_key", "sk-test");
//!
//! config()
//!     .switch(ContextRef::Current, &overrides, async {
//!         // Everything awaited here, including task runs, sees the overrides.
//!         assert_eq!(config().settings().task.rate_limit, 5.0);
//!     })
//!     .await?;
//! ```

pub mod context;
pub mod manager;
pub mod overrides;
pub mod schema;

pub use context::ConfigContext;
pub use manager::{
    bind, config, ConfigManager, ContextRef, DEFAULT_CONTEXT_NAME, TEMP_CONTEXT_NAME,
};
pub use overrides::ConfigOverrides;
pub use schema::{
    ApiConfig, DatasetDefaults, FileConfig, HttpConfig, PathSegment, ProcessingConfig, Section,
    Settings, TaskConfig,
};
