//! Context registry and per-flow active binding.
//!
//! The active context is stored in a tokio task-local, so every task (and
//! every closure run through [`ConfigManager::switch_sync`]) sees its own
//! binding. Concurrent switches on different tasks never observe each other.
//! Outside any scope the manager's root context applies.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::{debug, info};
use uuid::Uuid;

use super::context::ConfigContext;
use super::overrides::ConfigOverrides;
use super::schema::Settings;
use crate::error::ConfigError;

/// Name of the root context.
pub const DEFAULT_CONTEXT_NAME: &str = "default";

/// Name given to contexts derived on the fly by [`ConfigManager::switch`].
pub const TEMP_CONTEXT_NAME: &str = "_temp";

tokio::task_local! {
    static ACTIVE_CONTEXT: Arc<ConfigContext>;
}

/// Which context a switch starts from.
#[derive(Debug, Clone, Default)]
pub enum ContextRef {
    /// The context bound to the calling flow.
    #[default]
    Current,
    /// A registered context, looked up by id or by name.
    Identifier(String),
    /// A context given directly.
    Context(Arc<ConfigContext>),
}

impl From<&str> for ContextRef {
    fn from(identifier: &str) -> Self {
        Self::Identifier(identifier.to_string())
    }
}

impl From<String> for ContextRef {
    fn from(identifier: String) -> Self {
        Self::Identifier(identifier)
    }
}

impl From<Uuid> for ContextRef {
    fn from(id: Uuid) -> Self {
        Self::Identifier(id.to_string())
    }
}

impl From<Arc<ConfigContext>> for ContextRef {
    fn from(context: Arc<ConfigContext>) -> Self {
        Self::Context(context)
    }
}

impl From<Option<&str>> for ContextRef {
    fn from(identifier: Option<&str>) -> Self {
        identifier.map_or(Self::Current, Self::from)
    }
}

/// Registry of configuration contexts plus the root default.
pub struct ConfigManager {
    registry: RwLock<HashMap<String, Arc<ConfigContext>>>,
    root: RwLock<Arc<ConfigContext>>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl ConfigManager {
    /// Creates a manager whose root context holds `settings`.
    pub fn new(settings: Settings) -> Self {
        let root = Arc::new(ConfigContext::new(settings, DEFAULT_CONTEXT_NAME));
        let manager = Self {
            registry: RwLock::new(HashMap::new()),
            root: RwLock::new(Arc::clone(&root)),
        };
        manager.register(root);
        manager
    }

    /// The process-wide manager.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<ConfigManager> = OnceLock::new();
        GLOBAL.get_or_init(ConfigManager::default)
    }

    /// The context bound to the calling flow, or the root context.
    pub fn current(&self) -> Arc<ConfigContext> {
        ACTIVE_CONTEXT
            .try_with(Arc::clone)
            .unwrap_or_else(|_| self.root())
    }

    /// Settings of the current context.
    pub fn settings(&self) -> Arc<Settings> {
        self.current().shared_settings()
    }

    /// The root default context.
    pub fn root(&self) -> Arc<ConfigContext> {
        Arc::clone(&self.root.read().expect("root context lock poisoned"))
    }

    /// Makes a context discoverable by id and by name.
    ///
    /// A later registration under the same name shadows the earlier one for
    /// name lookups; lookups by id keep working for both.
    pub fn register(&self, context: Arc<ConfigContext>) {
        let mut registry = self.registry.write().expect("registry lock poisoned");
        debug!(name = %context.name(), id = %context.id(), "Registering config context");
        registry.insert(context.id().to_string(), Arc::clone(&context));
        registry.insert(context.name().to_string(), context);
    }

    /// Looks up a context by id or by name.
    pub fn get_context(&self, identifier: &str) -> Option<Arc<ConfigContext>> {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .get(identifier)
            .cloned()
    }

    /// Resolves the context a switch would bind.
    ///
    /// Unknown identifiers fall back to the current context. Non-empty
    /// overrides derive a transient context named [`TEMP_CONTEXT_NAME`].
    pub fn resolve(
        &self,
        target: ContextRef,
        overrides: &ConfigOverrides,
    ) -> Result<Arc<ConfigContext>, ConfigError> {
        let base = match target {
            ContextRef::Current => self.current(),
            ContextRef::Context(context) => context,
            ContextRef::Identifier(identifier) => {
                self.get_context(&identifier).unwrap_or_else(|| {
                    debug!(identifier = %identifier, "Unknown config context, using current");
                    self.current()
                })
            }
        };

        if overrides.is_empty() {
            return Ok(base);
        }
        Ok(Arc::new(base.clone_with(Some(TEMP_CONTEXT_NAME), overrides)?))
    }

    /// Runs `block` with the resolved context bound as current.
    ///
    /// The previous binding is restored when `block` completes, returns
    /// early, panics, or is dropped before completion.
    pub async fn switch<F>(
        &self,
        target: impl Into<ContextRef>,
        overrides: &ConfigOverrides,
        block: F,
    ) -> Result<F::Output, ConfigError>
    where
        F: Future,
    {
        let context = self.resolve(target.into(), overrides)?;
        Ok(bind(context, block).await)
    }

    /// Synchronous form of [`switch`](Self::switch) for closures.
    pub fn switch_sync<R>(
        &self,
        target: impl Into<ContextRef>,
        overrides: &ConfigOverrides,
        block: impl FnOnce() -> R,
    ) -> Result<R, ConfigError> {
        let context = self.resolve(target.into(), overrides)?;
        Ok(ACTIVE_CONTEXT.sync_scope(context, block))
    }

    /// Permanently makes a registered context the root default.
    ///
    /// Flows currently inside a switch keep their binding until it ends.
    pub fn set_global_default(&self, identifier: &str) -> Result<(), ConfigError> {
        let context = self
            .get_context(identifier)
            .ok_or_else(|| ConfigError::ContextNotFound(identifier.to_string()))?;
        info!(name = %context.name(), id = %context.id(), "Setting global default config context");
        *self.root.write().expect("root context lock poisoned") = context;
        Ok(())
    }
}

/// Shorthand for [`ConfigManager::global`].
pub fn config() -> &'static ConfigManager {
    ConfigManager::global()
}

/// Runs `future` with `context` bound as the current context.
///
/// Used to carry a caller's binding into spawned tasks, which do not inherit
/// task-locals.
pub async fn bind<F: Future>(context: Arc<ConfigContext>, future: F) -> F::Output {
    ACTIVE_CONTEXT.scope(context, future).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ApiConfig;
    use std::time::Duration;

    fn api_with_url(url: &str) -> ConfigOverrides {
        ConfigOverrides::new().with_api(ApiConfig {
            ollama_base_url: url.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_current_defaults_to_root() {
        let manager = ConfigManager::default();
        assert_eq!(manager.current().name(), DEFAULT_CONTEXT_NAME);
        assert!(manager.get_context(DEFAULT_CONTEXT_NAME).is_some());
    }

    #[test]
    fn test_global_is_shared() {
        let a = ConfigManager::global() as *const ConfigManager;
        let b = config() as *const ConfigManager;
        assert_eq!(a, b);
    }

    #[test]
    fn test_register_and_lookup_by_name_and_id() {
        let manager = ConfigManager::default();
        let mut settings = Settings::default();
        settings.api.openai_api_key = "test-key".to_string();
        let ctx = Arc::new(ConfigContext::new(settings, "test-env"));
        manager.register(Arc::clone(&ctx));

        let by_name = manager.get_context("test-env").expect("registered by name");
        assert_eq!(by_name.settings().api.openai_api_key, "test-key");

        let by_id = manager
            .get_context(&ctx.id().to_string())
            .expect("registered by id");
        assert_eq!(by_id.name(), "test-env");

        assert!(manager.get_context("missing").is_none());
    }

    #[tokio::test]
    async fn test_switch_by_name_restores() {
        let manager = ConfigManager::default();
        let mut settings = Settings::default();
        settings.api.ollama_base_url = "http://custom-server:11434".to_string();
        manager.register(Arc::new(ConfigContext::new(settings, "custom-env")));

        let seen = manager
            .switch("custom-env", &ConfigOverrides::new(), async {
                (
                    manager.current().name().to_string(),
                    manager.settings().api.ollama_base_url.clone(),
                )
            })
            .await
            .expect("switch should succeed");

        assert_eq!(seen.0, "custom-env");
        assert_eq!(seen.1, "http://custom-server:11434");
        assert_eq!(manager.settings().api.ollama_base_url, "http://localhost:11434");
    }

    #[tokio::test]
    async fn test_anonymous_switch_uses_temp_context() {
        let manager = ConfigManager::default();

        let name = manager
            .switch(ContextRef::Current, &api_with_url("http://temp-url"), async {
                assert_eq!(manager.settings().api.ollama_base_url, "http://temp-url");
                manager.current().name().to_string()
            })
            .await
            .expect("switch should succeed");

        assert_eq!(name, TEMP_CONTEXT_NAME);
        assert_eq!(manager.current().name(), DEFAULT_CONTEXT_NAME);
    }

    #[tokio::test]
    async fn test_unknown_identifier_falls_back_to_current() {
        let manager = ConfigManager::default();
        let name = manager
            .switch("nope", &ConfigOverrides::new(), async {
                manager.current().name().to_string()
            })
            .await
            .expect("switch should succeed");
        assert_eq!(name, DEFAULT_CONTEXT_NAME);
    }

    #[tokio::test]
    async fn test_nested_switch_restores_each_level() {
        let manager = ConfigManager::default();
        let outer = ConfigOverrides::new().set("max_workers", 2);
        let inner = ConfigOverrides::new().set("max_workers", 3);

        manager
            .switch(ContextRef::Current, &outer, async {
                assert_eq!(manager.settings().task.max_workers, 2);
                manager
                    .switch(ContextRef::Current, &inner, async {
                        assert_eq!(manager.settings().task.max_workers, 3);
                    })
                    .await
                    .expect("inner switch");
                assert_eq!(manager.settings().task.max_workers, 2);
            })
            .await
            .expect("outer switch");

        assert_eq!(manager.settings().task.max_workers, 4);
    }

    #[tokio::test]
    async fn test_switch_restores_after_error() {
        let manager = ConfigManager::default();
        let result: Result<(), String> = manager
            .switch(ContextRef::Current, &ConfigOverrides::new().set("seed", 1), async {
                Err("block failed".to_string())
            })
            .await
            .expect("switch itself succeeds");

        assert!(result.is_err());
        assert_eq!(manager.settings().proc.seed, 42);
    }

    #[test]
    fn test_switch_sync_restores_after_panic() {
        let manager = ConfigManager::default();
        let overrides = ConfigOverrides::new().set("seed", 9);

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            manager
                .switch_sync(ContextRef::Current, &overrides, || {
                    assert_eq!(manager.settings().proc.seed, 9);
                    panic!("boom");
                })
                .ok();
        }));

        assert!(outcome.is_err());
        assert_eq!(manager.settings().proc.seed, 42);
    }

    #[test]
    fn test_switch_with_invalid_override_fails() {
        let manager = ConfigManager::default();
        let result = manager.switch_sync(
            ContextRef::Current,
            &ConfigOverrides::new().set("max_workers", "many"),
            || (),
        );
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_switch_to_context_object() {
        let manager = ConfigManager::default();
        let ctx = Arc::new(ConfigContext::new(Settings::default(), "unregistered"));
        let name = manager
            .switch_sync(Arc::clone(&ctx), &ConfigOverrides::new(), || {
                manager.current().id()
            })
            .expect("switch");
        assert_eq!(name, ctx.id());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_switches_are_isolated() {
        let manager = Arc::new(ConfigManager::default());
        let mut handles = Vec::new();

        for i in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let url = format!("http://server-{}", i);
                let overrides = api_with_url(&url);
                let isolated = manager
                    .switch(ContextRef::Current, &overrides, async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        manager.settings().api.ollama_base_url == url
                    })
                    .await
                    .expect("switch");
                isolated
            }));
        }

        for handle in handles {
            assert!(handle.await.expect("task should not panic"));
        }
        assert_eq!(manager.settings().api.ollama_base_url, "http://localhost:11434");
    }

    #[test]
    fn test_thread_switches_are_isolated() {
        let manager = Arc::new(ConfigManager::default());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    let url = format!("http://thread-{}", i);
                    let overrides = api_with_url(&url);
                    let isolated = manager
                        .switch_sync(ContextRef::Current, &overrides, || {
                            std::thread::sleep(Duration::from_millis(50));
                            manager.settings().api.ollama_base_url == url
                        })
                        .expect("switch");
                    isolated
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().expect("thread should not panic"));
        }
    }

    #[tokio::test]
    async fn test_set_global_default() {
        let manager = ConfigManager::default();
        let mut settings = Settings::default();
        settings.task.max_workers = 12;
        manager.register(Arc::new(ConfigContext::new(settings, "prod")));

        manager.set_global_default("prod").expect("registered");
        assert_eq!(manager.current().name(), "prod");
        assert_eq!(manager.settings().task.max_workers, 12);

        assert!(matches!(
            manager.set_global_default("missing"),
            Err(ConfigError::ContextNotFound(_))
        ));
        assert_eq!(manager.current().name(), "prod");
    }

    #[tokio::test]
    async fn test_bind_carries_context_into_spawned_task() {
        let manager = Arc::new(ConfigManager::default());
        let ctx = manager
            .resolve(ContextRef::Current, &ConfigOverrides::new().set("seed", 5))
            .expect("resolve");

        let seen = {
            let manager = Arc::clone(&manager);
            tokio::spawn(bind(ctx, async move { manager.settings().proc.seed }))
                .await
                .expect("join")
        };
        assert_eq!(seen, 5);
    }
}
