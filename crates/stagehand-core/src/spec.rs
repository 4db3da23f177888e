//! The Spec: shared mutable state threaded through a pipeline run.
//!
//! Recognised option keys live in typed slots; everything else (stage
//! derived values, runner outcome keys, advice-contributed keys) lives in a
//! residual bag that keeps insertion order. All keys are reachable through
//! the same `get`/`set`/`pop`/`contains` contract.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Well-known Spec keys.
pub mod keys {
    pub const TEST_REGISTRY_NAMES: &str = "test_registry_names";
    pub const TEST_PACKAGE_NAMES: &str = "test_package_names";
    pub const SOURCE_ARTIFACTS: &str = "source_artifacts";
    pub const BEFORE_KARMA_ADVICE_LIST: &str = "before_karma_advice_list";
    pub const EXTRA_FRAMEWORKS: &str = "extra_frameworks";
    pub const TOOLCHAIN_PACKAGE: &str = "toolchain_package";
    pub const ABORT_ON_TEST_FAILURE: &str = "abort_on_test_failure";
    pub const BUILD_DIR: &str = "build_dir";

    // Derived by the prepare stage.
    pub const MODULE_REGISTRY_NAMES: &str = "module_registry_names";
    pub const TEST_MODULE_PATHS: &str = "test_module_paths";
}

/// Shared key-value state for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    test_registry_names: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    test_package_names: Option<Vec<String>>,

    /// Order is significant and never re-sorted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_artifacts: Option<Vec<PathBuf>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    before_karma_advice_list: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    extra_frameworks: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    toolchain_package: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    abort_on_test_failure: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    build_dir: Option<PathBuf>,

    #[serde(flatten)]
    extras: IndexMap<String, Value>,
}

impl Spec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a Spec from an initial mapping, applying entries in order.
    ///
    /// Duplicate keys are resolved last-write-wins.
    pub fn from_entries<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut spec = Self::new();
        for (key, value) in entries {
            spec.set(key, value);
        }
        spec
    }

    /// Read any key, typed or residual.
    pub fn get(&self, key: &str) -> Option<Value> {
        let typed = match key {
            keys::TEST_REGISTRY_NAMES => to_value(&self.test_registry_names),
            keys::TEST_PACKAGE_NAMES => to_value(&self.test_package_names),
            keys::SOURCE_ARTIFACTS => to_value(&self.source_artifacts),
            keys::BEFORE_KARMA_ADVICE_LIST => to_value(&self.before_karma_advice_list),
            keys::EXTRA_FRAMEWORKS => to_value(&self.extra_frameworks),
            keys::TOOLCHAIN_PACKAGE => to_value(&self.toolchain_package),
            keys::ABORT_ON_TEST_FAILURE => to_value(&self.abort_on_test_failure),
            keys::BUILD_DIR => to_value(&self.build_dir),
            _ => None,
        };
        typed.or_else(|| self.extras.get(key).cloned())
    }

    /// Read a key, falling back to `default` when absent.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    /// Write any key. Never fails.
    ///
    /// A recognised key given a value of the wrong shape is kept untyped in
    /// the residual bag, and `null` clears a recognised key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        let extras = &mut self.extras;
        match key.as_str() {
            keys::TEST_REGISTRY_NAMES => assign(&mut self.test_registry_names, extras, &key, value),
            keys::TEST_PACKAGE_NAMES => assign(&mut self.test_package_names, extras, &key, value),
            keys::SOURCE_ARTIFACTS => assign(&mut self.source_artifacts, extras, &key, value),
            keys::BEFORE_KARMA_ADVICE_LIST => {
                assign(&mut self.before_karma_advice_list, extras, &key, value)
            }
            keys::EXTRA_FRAMEWORKS => assign(&mut self.extra_frameworks, extras, &key, value),
            keys::TOOLCHAIN_PACKAGE => assign(&mut self.toolchain_package, extras, &key, value),
            keys::ABORT_ON_TEST_FAILURE => {
                assign(&mut self.abort_on_test_failure, extras, &key, value)
            }
            keys::BUILD_DIR => assign(&mut self.build_dir, extras, &key, value),
            _ => {
                extras.insert(key, value);
            }
        }
    }

    /// Remove a key, returning its value if it was present.
    pub fn pop(&mut self, key: &str) -> Option<Value> {
        let typed = match key {
            keys::TEST_REGISTRY_NAMES => take_value(&mut self.test_registry_names),
            keys::TEST_PACKAGE_NAMES => take_value(&mut self.test_package_names),
            keys::SOURCE_ARTIFACTS => take_value(&mut self.source_artifacts),
            keys::BEFORE_KARMA_ADVICE_LIST => take_value(&mut self.before_karma_advice_list),
            keys::EXTRA_FRAMEWORKS => take_value(&mut self.extra_frameworks),
            keys::TOOLCHAIN_PACKAGE => take_value(&mut self.toolchain_package),
            keys::ABORT_ON_TEST_FAILURE => take_value(&mut self.abort_on_test_failure),
            keys::BUILD_DIR => take_value(&mut self.build_dir),
            _ => None,
        };
        typed.or_else(|| self.extras.shift_remove(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        let typed = match key {
            keys::TEST_REGISTRY_NAMES => self.test_registry_names.is_some(),
            keys::TEST_PACKAGE_NAMES => self.test_package_names.is_some(),
            keys::SOURCE_ARTIFACTS => self.source_artifacts.is_some(),
            keys::BEFORE_KARMA_ADVICE_LIST => self.before_karma_advice_list.is_some(),
            keys::EXTRA_FRAMEWORKS => self.extra_frameworks.is_some(),
            keys::TOOLCHAIN_PACKAGE => self.toolchain_package.is_some(),
            keys::ABORT_ON_TEST_FAILURE => self.abort_on_test_failure.is_some(),
            keys::BUILD_DIR => self.build_dir.is_some(),
            _ => false,
        };
        typed || self.extras.contains_key(key)
    }

    // Typed accessors for recognised keys.

    pub fn test_registry_names(&self) -> Option<&[String]> {
        self.test_registry_names.as_deref()
    }

    pub fn set_test_registry_names(&mut self, names: Vec<String>) {
        self.extras.shift_remove(keys::TEST_REGISTRY_NAMES);
        self.test_registry_names = Some(names);
    }

    pub fn test_package_names(&self) -> Option<&[String]> {
        self.test_package_names.as_deref()
    }

    pub fn set_test_package_names(&mut self, names: Vec<String>) {
        self.extras.shift_remove(keys::TEST_PACKAGE_NAMES);
        self.test_package_names = Some(names);
    }

    pub fn source_artifacts(&self) -> &[PathBuf] {
        self.source_artifacts.as_deref().unwrap_or_default()
    }

    pub fn set_source_artifacts(&mut self, artifacts: Vec<PathBuf>) {
        self.extras.shift_remove(keys::SOURCE_ARTIFACTS);
        self.source_artifacts = Some(artifacts);
    }

    pub fn before_karma_advice_list(&self) -> &[String] {
        self.before_karma_advice_list.as_deref().unwrap_or_default()
    }

    pub fn set_before_karma_advice_list(&mut self, names: Vec<String>) {
        self.extras.shift_remove(keys::BEFORE_KARMA_ADVICE_LIST);
        self.before_karma_advice_list = Some(names);
    }

    pub fn extra_frameworks(&self) -> &[String] {
        self.extra_frameworks.as_deref().unwrap_or_default()
    }

    pub fn set_extra_frameworks(&mut self, frameworks: Vec<String>) {
        self.extras.shift_remove(keys::EXTRA_FRAMEWORKS);
        self.extra_frameworks = Some(frameworks);
    }

    pub fn toolchain_package(&self) -> Option<&str> {
        self.toolchain_package.as_deref()
    }

    pub fn set_toolchain_package(&mut self, package: String) {
        self.extras.shift_remove(keys::TOOLCHAIN_PACKAGE);
        self.toolchain_package = Some(package);
    }

    /// Whether a failing test run should abort the pipeline (default `true`).
    pub fn abort_on_test_failure(&self) -> bool {
        self.abort_on_test_failure.unwrap_or(true)
    }

    pub fn set_abort_on_test_failure(&mut self, abort: bool) {
        self.extras.shift_remove(keys::ABORT_ON_TEST_FAILURE);
        self.abort_on_test_failure = Some(abort);
    }

    pub fn build_dir(&self) -> Option<&Path> {
        self.build_dir.as_deref()
    }

    pub fn set_build_dir(&mut self, dir: PathBuf) {
        self.extras.shift_remove(keys::BUILD_DIR);
        self.build_dir = Some(dir);
    }

    // Helpers over residual keys.

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.extras.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.extras.get(key).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.extras.get(key).and_then(Value::as_i64)
    }

    /// A residual list of strings; non-string entries are skipped.
    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        self.extras
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_path_list(&self, key: &str) -> Vec<PathBuf> {
        self.get_string_list(key)
            .into_iter()
            .map(PathBuf::from)
            .collect()
    }

    /// Residual keys in insertion order.
    pub fn residual_keys(&self) -> impl Iterator<Item = &str> {
        self.extras.keys().map(String::as_str)
    }

    /// The whole Spec as a flat JSON object.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn to_value<T: Serialize>(slot: &Option<T>) -> Option<Value> {
    slot.as_ref().and_then(|v| serde_json::to_value(v).ok())
}

fn take_value<T: Serialize>(slot: &mut Option<T>) -> Option<Value> {
    slot.take().and_then(|v| serde_json::to_value(v).ok())
}

fn assign<T: DeserializeOwned>(
    slot: &mut Option<T>,
    extras: &mut IndexMap<String, Value>,
    key: &str,
    value: Value,
) {
    extras.shift_remove(key);
    if value.is_null() {
        *slot = None;
        return;
    }
    match serde_json::from_value::<T>(value.clone()) {
        Ok(typed) => *slot = Some(typed),
        Err(err) => {
            warn!(key, error = %err, "value has an unexpected shape; keeping it untyped");
            *slot = None;
            extras.insert(key.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_typed_key() {
        let mut spec = Spec::new();
        spec.set(keys::EXTRA_FRAMEWORKS, json!(["jasmine"]));
        assert_eq!(spec.extra_frameworks(), ["jasmine".to_string()]);
        assert_eq!(spec.get(keys::EXTRA_FRAMEWORKS), Some(json!(["jasmine"])));
        assert!(spec.contains(keys::EXTRA_FRAMEWORKS));
    }

    #[test]
    fn test_unknown_key_is_kept() {
        let mut spec = Spec::new();
        spec.set("some_advice_marker", json!({"nested": true}));
        assert!(spec.contains("some_advice_marker"));
        assert_eq!(spec.get("some_advice_marker"), Some(json!({"nested": true})));
        assert_eq!(spec.get_or("missing", json!(1)), json!(1));
    }

    #[test]
    fn test_incompatible_value_last_write_wins() {
        let mut spec = Spec::new();
        spec.set(keys::ABORT_ON_TEST_FAILURE, false);
        spec.set(keys::ABORT_ON_TEST_FAILURE, "sometimes");

        assert_eq!(spec.get(keys::ABORT_ON_TEST_FAILURE), Some(json!("sometimes")));
        // The typed view falls back to the default.
        assert!(spec.abort_on_test_failure());

        spec.set(keys::ABORT_ON_TEST_FAILURE, false);
        assert_eq!(spec.get(keys::ABORT_ON_TEST_FAILURE), Some(json!(false)));
        assert_eq!(spec.residual_keys().count(), 0);
    }

    #[test]
    fn test_pop_typed_and_residual() {
        let mut spec = Spec::from_entries([
            (keys::TOOLCHAIN_PACKAGE, json!("example.package")),
            ("link", json!("linked")),
        ]);

        assert_eq!(spec.pop(keys::TOOLCHAIN_PACKAGE), Some(json!("example.package")));
        assert!(spec.toolchain_package().is_none());
        assert_eq!(spec.pop("link"), Some(json!("linked")));
        assert_eq!(spec.pop("link"), None);
    }

    #[test]
    fn test_null_clears_recognised_key() {
        let mut spec = Spec::new();
        spec.set_test_package_names(vec!["pkg".to_string()]);
        spec.set(keys::TEST_PACKAGE_NAMES, Value::Null);
        assert!(!spec.contains(keys::TEST_PACKAGE_NAMES));
    }

    #[test]
    fn test_source_artifacts_order_preserved() {
        let paths = vec!["z.js", "a.js", "m.js", "a.js"];
        let spec = Spec::from_entries([(keys::SOURCE_ARTIFACTS, json!(paths))]);
        let stored: Vec<_> = spec
            .source_artifacts()
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        assert_eq!(stored, paths);
    }

    #[test]
    fn test_abort_default_true() {
        let spec = Spec::new();
        assert!(spec.abort_on_test_failure());
        assert!(!spec.contains(keys::ABORT_ON_TEST_FAILURE));
    }

    #[test]
    fn test_to_value_is_flat() {
        let mut spec = Spec::new();
        spec.set_abort_on_test_failure(false);
        spec.set("karma_return_code", 1);
        assert_eq!(
            spec.to_value(),
            json!({"abort_on_test_failure": false, "karma_return_code": 1})
        );
    }

    #[test]
    fn test_residual_helpers() {
        let spec = Spec::from_entries([
            ("coverage_enable", json!(true)),
            ("coverage_dir", json!("coverage")),
            ("karma_return_code", json!(2)),
            ("test_module_paths", json!(["a.js", 3, "b.js"])),
        ]);
        assert_eq!(spec.get_bool("coverage_enable"), Some(true));
        assert_eq!(spec.get_str("coverage_dir"), Some("coverage"));
        assert_eq!(spec.get_i64("karma_return_code"), Some(2));
        assert_eq!(spec.get_string_list("test_module_paths"), vec!["a.js", "b.js"]);
        assert!(spec.get_path_list("missing").is_empty());
    }
}
