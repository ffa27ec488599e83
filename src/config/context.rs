//! Identified configuration contexts.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use super::overrides::ConfigOverrides;
use super::schema::Settings;
use crate::error::ConfigError;

/// A configuration snapshot with an identity and a human-readable name.
///
/// Identity is never derived from content: two contexts built from equal
/// settings still have different ids.
#[derive(Debug)]
pub struct ConfigContext {
    id: Uuid,
    name: String,
    settings: Arc<Settings>,
}

impl ConfigContext {
    /// Creates a context with a fresh id.
    pub fn new(settings: Settings, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            settings: Arc::new(settings),
        }
    }

    /// Globally unique id of this context.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Shared handle to the settings snapshot.
    pub fn shared_settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    /// Derives a new context with `overrides` applied.
    ///
    /// The new context keeps this context's name unless `name` is given, and
    /// always receives a new id.
    pub fn clone_with(
        &self,
        name: Option<&str>,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let settings = if overrides.is_empty() {
            self.settings().clone()
        } else {
            self.settings.derive(overrides)?
        };
        Ok(Self::new(settings, name.unwrap_or(&self.name)))
    }
}

impl fmt::Display for ConfigContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id.simple().to_string();
        write!(f, "<ConfigContext name={} id={}>", self.name, &id[..8])
    }
}
