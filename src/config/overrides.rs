//! Override sets used to derive new configuration snapshots.
//!
//! An override set is an ordered list of `key -> value` entries. Keys are
//! resolved against a field table built once from the structure of
//! [`Settings`]:
//!
//! - `rate_limit`: a leaf field, merged into the section that declares it
//! - `task.rate_limit`: a field addressed through its section
//! - `task` with an object value: replaces the whole section; fields the
//!   object does not mention take their defaults
//! - `extra` with an object value: merged into the extension map
//! - anything else: stored verbatim in the extension map

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde_json::{Map, Value};
use tracing::warn;

use super::schema::{
    ApiConfig, DatasetDefaults, FileConfig, HttpConfig, ProcessingConfig, Section, Settings,
    TaskConfig, EXTRA_SECTION, SECTION_NAMES,
};
use crate::error::ConfigError;

type ReplaceFn = Arc<dyn Fn(&mut Settings) + Send + Sync>;

#[derive(Clone)]
enum Entry {
    Value { key: String, value: Value },
    Replace { section: &'static str, apply: ReplaceFn },
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Value { key, value } => write!(f, "{} = {}", key, value),
            Entry::Replace { section, .. } => write!(f, "{} = <section>", section),
        }
    }
}

/// An ordered set of configuration overrides.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    entries: Vec<Entry>,
}

impl ConfigOverrides {
    /// Creates an empty override set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, a dotted `section.field` path, a whole section given as
    /// an object, or an extension key.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.push(Entry::Value {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Replaces a whole section with a typed value.
    pub fn replace<S: Section>(mut self, section: S) -> Self {
        self.entries.push(Entry::Replace {
            section: S::NAME,
            apply: Arc::new(move |settings: &mut Settings| *S::slot(settings) = section.clone()),
        });
        self
    }

    pub fn with_api(self, api: ApiConfig) -> Self {
        self.replace(api)
    }

    pub fn with_http(self, http: HttpConfig) -> Self {
        self.replace(http)
    }

    pub fn with_proc(self, proc: ProcessingConfig) -> Self {
        self.replace(proc)
    }

    pub fn with_file(self, file: FileConfig) -> Self {
        self.replace(file)
    }

    pub fn with_task(self, task: TaskConfig) -> Self {
        self.replace(task)
    }

    pub fn with_ds(self, ds: DatasetDefaults) -> Self {
        self.replace(ds)
    }

    /// Builds an override set from a JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        map.into_iter().collect()
    }

    /// Returns `true` if no overrides are set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of override entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Applies the overrides, in order, to a copy of `base`.
    pub(crate) fn apply(&self, base: &Settings) -> Result<Settings, ConfigError> {
        let mut settings = base.clone();
        for entry in &self.entries {
            match entry {
                Entry::Replace { apply, .. } => apply(&mut settings),
                Entry::Value { key, value } => apply_value(&mut settings, key, value.clone())?,
            }
        }
        Ok(settings)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ConfigOverrides {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |overrides, (k, v)| overrides.set(k, v))
    }
}

/// Maps every leaf field name to the sections that declare it.
///
/// Built once from the serialized default snapshot, so it always mirrors
/// the declared structure of [`Settings`].
fn field_table() -> &'static HashMap<String, Vec<&'static str>> {
    static TABLE: OnceLock<HashMap<String, Vec<&'static str>>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: HashMap<String, Vec<&'static str>> = HashMap::new();
        let Ok(Value::Object(root)) = serde_json::to_value(Settings::default()) else {
            return table;
        };
        for section in SECTION_NAMES {
            if let Some(Value::Object(fields)) = root.get(section) {
                for field in fields.keys() {
                    table.entry(field.clone()).or_default().push(section);
                }
            }
        }
        table
    })
}

fn is_section(name: &str) -> bool {
    SECTION_NAMES.iter().any(|s| *s == name)
}

fn section_declares(section: &str, field: &str) -> bool {
    field_table()
        .get(field)
        .is_some_and(|sections| sections.iter().any(|s| *s == section))
}

fn apply_value(settings: &mut Settings, key: &str, value: Value) -> Result<(), ConfigError> {
    if key == EXTRA_SECTION {
        return match value {
            Value::Object(map) => {
                settings.extra.extend(map);
                Ok(())
            }
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected an object, got {}", other),
            }),
        };
    }

    if is_section(key) {
        return replace_section(settings, key, value);
    }

    if let Some((section, field)) = key.split_once('.') {
        if section == EXTRA_SECTION {
            settings.extra.insert(field.to_string(), value);
            return Ok(());
        }
        if is_section(section) && section_declares(section, field) {
            return merge_field(settings, section, field, key, value);
        }
    } else if let Some(sections) = field_table().get(key) {
        return match sections.as_slice() {
            [section] => merge_field(settings, section, key, key, value),
            many => Err(ConfigError::AmbiguousKey {
                key: key.to_string(),
                sections: many.iter().map(|s| s.to_string()).collect(),
            }),
        };
    }

    warn!(key = %key, "Unknown configuration key, storing in extra");
    settings.extra.insert(key.to_string(), value);
    Ok(())
}

fn replace_section(settings: &mut Settings, section: &str, value: Value) -> Result<(), ConfigError> {
    if !value.is_object() {
        return Err(ConfigError::InvalidValue {
            key: section.to_string(),
            message: format!("expected an object for section replacement, got {}", value),
        });
    }
    match section {
        "api" => replace_typed::<ApiConfig>(settings, value),
        "http" => replace_typed::<HttpConfig>(settings, value),
        "proc" => replace_typed::<ProcessingConfig>(settings, value),
        "file" => replace_typed::<FileConfig>(settings, value),
        "task" => replace_typed::<TaskConfig>(settings, value),
        "ds" => replace_typed::<DatasetDefaults>(settings, value),
        _ => unreachable!("section names are checked against SECTION_NAMES"),
    }
}

fn merge_field(
    settings: &mut Settings,
    section: &str,
    field: &str,
    key: &str,
    value: Value,
) -> Result<(), ConfigError> {
    match section {
        "api" => merge_typed::<ApiConfig>(settings, field, key, value),
        "http" => merge_typed::<HttpConfig>(settings, field, key, value),
        "proc" => merge_typed::<ProcessingConfig>(settings, field, key, value),
        "file" => merge_typed::<FileConfig>(settings, field, key, value),
        "task" => merge_typed::<TaskConfig>(settings, field, key, value),
        "ds" => merge_typed::<DatasetDefaults>(settings, field, key, value),
        _ => unreachable!("section names are checked against SECTION_NAMES"),
    }
}

fn replace_typed<S: Section>(settings: &mut Settings, value: Value) -> Result<(), ConfigError> {
    let section: S = serde_json::from_value(value).map_err(|e| ConfigError::InvalidValue {
        key: S::NAME.to_string(),
        message: e.to_string(),
    })?;
    *S::slot(settings) = section;
    Ok(())
}

fn merge_typed<S: Section>(
    settings: &mut Settings,
    field: &str,
    key: &str,
    value: Value,
) -> Result<(), ConfigError> {
    let mut current = serde_json::to_value(&*S::slot(settings))?;
    if let Value::Object(fields) = &mut current {
        fields.insert(field.to_string(), value);
    }
    let merged: S = serde_json::from_value(current).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    *S::slot(settings) = merged;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_key_changes_only_that_field() {
        let base = Settings::default();
        let derived = base
            .derive(&ConfigOverrides::new().set("rate_limit", 7.5))
            .expect("derive should succeed");

        assert!((derived.task.rate_limit - 7.5).abs() < f64::EPSILON);

        let mut expected = base.clone();
        expected.task.rate_limit = 7.5;
        assert_eq!(derived, expected);
        // Original is untouched.
        assert_eq!(base.task.rate_limit, 0.0);
    }

    #[test]
    fn test_every_known_leaf_field_round_trips() {
        let base = Settings::default();
        let cases = [
            ("openai_api_key", json!("sk-1"), "api"),
            ("url", json!("http://example.com"), "http"),
            ("batch_size", json!(7), "proc"),
            ("encoding", json!("latin-1"), "file"),
            ("max_workers", json!(11), "task"),
            ("role_map", json!({"user": "u"}), "ds"),
        ];

        for (key, value, section) in cases {
            let derived = base
                .derive(&ConfigOverrides::new().set(key, value.clone()))
                .expect("derive should succeed");
            let root = serde_json::to_value(&derived).expect("serialize");
            assert_eq!(root[section][key], value, "field {}", key);

            for other in SECTION_NAMES.iter().filter(|s| **s != section) {
                let before = serde_json::to_value(&base).expect("serialize");
                assert_eq!(root[*other], before[*other], "section {} changed", other);
            }
        }
    }

    #[test]
    fn test_dotted_key_targets_section() {
        let derived = Settings::default()
            .derive(&ConfigOverrides::new().set("file.format", "json"))
            .expect("derive should succeed");

        assert_eq!(derived.file.format, "json");
        assert_eq!(derived.ds.format, "jsonl");
    }

    #[test]
    fn test_ambiguous_flat_key_is_rejected() {
        let result = Settings::default().derive(&ConfigOverrides::new().set("format", "json"));

        match result {
            Err(ConfigError::AmbiguousKey { key, sections }) => {
                assert_eq!(key, "format");
                assert_eq!(sections, vec!["file".to_string(), "ds".to_string()]);
            }
            other => panic!("expected ambiguity error, got {:?}", other),
        }
    }

    #[test]
    fn test_section_object_replaces_whole_section() {
        let mut base = Settings::default();
        base.api.openai_api_key = "sk-base".to_string();

        let derived = base
            .derive(&ConfigOverrides::new().set("api", json!({"ollama_base_url": "http://temp"})))
            .expect("derive should succeed");

        assert_eq!(derived.api.ollama_base_url, "http://temp");
        // Replacement, not merge: unspecified fields fall back to defaults.
        assert_eq!(derived.api.openai_api_key, "");
        assert_eq!(derived.task, base.task);
    }

    #[test]
    fn test_typed_replacement() {
        let proc = ProcessingConfig {
            batch_size: 99,
            ..Default::default()
        };
        let derived = Settings::default()
            .derive(&ConfigOverrides::new().with_proc(proc.clone()))
            .expect("derive should succeed");

        assert_eq!(derived.proc, proc);
        assert_eq!(derived.api, ApiConfig::default());
    }

    #[test]
    fn test_unknown_key_goes_to_extra() {
        let derived = Settings::default()
            .derive(&ConfigOverrides::new().set("temperatur", 0.2).set("extra.tag", "v1"))
            .expect("unknown keys are absorbed");

        assert_eq!(derived.extra.get("temperatur"), Some(&json!(0.2)));
        assert_eq!(derived.extra.get("tag"), Some(&json!("v1")));
        assert_eq!(derived.task, TaskConfig::default());
    }

    #[test]
    fn test_unknown_dotted_field_goes_to_extra() {
        let derived = Settings::default()
            .derive(&ConfigOverrides::new().set("task.speed", 3))
            .expect("unknown keys are absorbed");

        assert_eq!(derived.extra.get("task.speed"), Some(&json!(3)));
    }

    #[test]
    fn test_extra_object_merges() {
        let derived = Settings::default()
            .derive(
                &ConfigOverrides::new()
                    .set("extra", json!({"a": 1}))
                    .set("extra", json!({"b": 2})),
            )
            .expect("derive should succeed");

        assert_eq!(derived.extra.len(), 2);
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let result =
            Settings::default().derive(&ConfigOverrides::new().set("max_workers", "lots"));
        assert!(matches!(result, Err(ConfigError::InvalidValue { key, .. }) if key == "max_workers"));

        let result = Settings::default().derive(&ConfigOverrides::new().set("task", 3));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_null_clears_optional_field() {
        let mut base = Settings::default();
        base.task.checkpoint_path = Some("ckpt.log".into());

        let derived = base
            .derive(&ConfigOverrides::new().set("checkpoint_path", Value::Null))
            .expect("derive should succeed");
        assert_eq!(derived.task.checkpoint_path, None);
    }

    #[test]
    fn test_later_entries_win() {
        let overrides: ConfigOverrides = vec![("max_workers", json!(2)), ("task.max_workers", json!(5))]
            .into_iter()
            .collect();
        assert_eq!(overrides.len(), 2);

        let derived = Settings::default().derive(&overrides).expect("derive");
        assert_eq!(derived.task.max_workers, 5);
    }

    #[test]
    fn test_from_map() {
        let map = json!({"seed": 7, "ordered_results": false});
        let Value::Object(map) = map else { unreachable!() };

        let derived = Settings::default()
            .derive(&ConfigOverrides::from_map(map))
            .expect("derive");
        assert_eq!(derived.proc.seed, 7);
        assert!(!derived.task.ordered_results);
    }

    #[test]
    fn test_field_table_is_static() {
        let table = field_table();
        assert_eq!(table.get("rate_limit"), Some(&vec!["task"]));
        assert_eq!(table.get("format"), Some(&vec!["file", "ds"]));
        assert!(table.get("extra").is_none());
    }
}
