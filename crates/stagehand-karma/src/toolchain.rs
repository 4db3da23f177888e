//! Test toolchains.
//!
//! Both toolchains expand test packages into the registries and module paths
//! the runner configuration consumes during `prepare`. A [`TestToolchain`]
//! may wrap another toolchain, whose stage bodies then run as usual.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use stagehand_core::{keys as core_keys, ExtensionRegistry, Spec, Toolchain};
use tracing::{debug, warn};

use crate::config::CoverageConfig;

/// Resolves test registries into test module paths.
#[derive(Clone, Default)]
pub struct TestToolchain {
    extensions: Arc<ExtensionRegistry>,
    inner: Option<Arc<dyn Toolchain>>,
}

impl TestToolchain {
    pub fn new(extensions: Arc<ExtensionRegistry>) -> Self {
        Self {
            extensions,
            inner: None,
        }
    }

    /// Resolve test modules, then run `inner` for every stage.
    pub fn wrapping(extensions: Arc<ExtensionRegistry>, inner: Arc<dyn Toolchain>) -> Self {
        Self {
            extensions,
            inner: Some(inner),
        }
    }

    /// Explicit registry names win over those declared by test packages.
    fn registry_names(&self, spec: &Spec) -> Vec<String> {
        match spec.test_registry_names() {
            Some(names) => names.to_vec(),
            None => self
                .extensions
                .registries_for_packages(spec.test_package_names().unwrap_or_default()),
        }
    }

    fn prepare_modules(&self, spec: &mut Spec) {
        let registries = self.registry_names(spec);

        let mut paths = spec.get_path_list(core_keys::TEST_MODULE_PATHS);
        for name in &registries {
            let modules = self.extensions.registry_modules(name);
            if modules.is_empty() {
                warn!(registry = %name, "Test registry has no modules");
            }
            for module in modules {
                if !paths.contains(module) {
                    paths.push(module.clone());
                }
            }
        }

        debug!(
            registries = ?registries,
            modules = paths.len(),
            "Resolved test modules"
        );
        spec.set(core_keys::MODULE_REGISTRY_NAMES, Value::from(registries));
        spec.set(core_keys::TEST_MODULE_PATHS, path_list(&paths));
    }
}

impl std::fmt::Debug for TestToolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestToolchain")
            .field("extensions", &self.extensions)
            .field("inner", &self.inner.as_ref().map(|inner| inner.name()))
            .finish()
    }
}

impl Toolchain for TestToolchain {
    fn name(&self) -> &str {
        match &self.inner {
            Some(inner) => inner.name(),
            None => "test",
        }
    }

    fn prepare(&self, spec: &mut Spec) -> anyhow::Result<()> {
        self.prepare_modules(spec);
        match &self.inner {
            Some(inner) => inner.prepare(spec),
            None => Ok(()),
        }
    }

    fn compile(&self, spec: &mut Spec) -> anyhow::Result<()> {
        match &self.inner {
            Some(inner) => inner.compile(spec),
            None => Ok(()),
        }
    }

    fn assemble(&self, spec: &mut Spec) -> anyhow::Result<()> {
        match &self.inner {
            Some(inner) => inner.assemble(spec),
            None => Ok(()),
        }
    }

    fn link(&self, spec: &mut Spec) -> anyhow::Result<()> {
        match &self.inner {
            Some(inner) => inner.link(spec),
            None => Ok(()),
        }
    }
}

/// A [`TestToolchain`] that also carries coverage settings.
#[derive(Debug, Clone)]
pub struct KarmaToolchain {
    base: TestToolchain,
    coverage: CoverageConfig,
}

impl KarmaToolchain {
    pub fn new(extensions: Arc<ExtensionRegistry>) -> Self {
        Self::with_coverage(extensions, CoverageConfig::default())
    }

    pub fn with_coverage(extensions: Arc<ExtensionRegistry>, coverage: CoverageConfig) -> Self {
        Self {
            base: TestToolchain::new(extensions),
            coverage,
        }
    }

    pub fn coverage(&self) -> &CoverageConfig {
        &self.coverage
    }
}

impl Toolchain for KarmaToolchain {
    fn name(&self) -> &str {
        "karma"
    }

    fn prepare(&self, spec: &mut Spec) -> anyhow::Result<()> {
        self.base.prepare(spec)?;
        self.coverage.apply_defaults(spec);
        Ok(())
    }
}

fn path_list(paths: &[PathBuf]) -> Value {
    Value::Array(
        paths
            .iter()
            .map(|p| Value::from(p.to_string_lossy().into_owned()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::build_config;
    use crate::keys;
    use serde_json::json;
    use stagehand_core::{ExtensionManifest, NullToolchain};

    const MANIFEST: &str = r#"
[[registry]]
name = "unit"
modules = ["/t/unit_a.js", "/t/unit_b.js"]

[[registry]]
name = "widgets"
modules = ["/t/widgets.js", "/t/unit_a.js"]

[[package]]
name = "app"
registries = ["unit", "widgets"]

[[package]]
name = "lib"
registries = ["widgets"]
"#;

    fn extensions() -> Arc<ExtensionRegistry> {
        let manifest = ExtensionManifest::from_toml_str(MANIFEST).unwrap();
        Arc::new(ExtensionRegistry::from_manifest(manifest).unwrap())
    }

    #[test]
    fn test_packages_expand_to_registries() {
        let toolchain = TestToolchain::new(extensions());
        let mut spec = Spec::from_entries([(core_keys::TEST_PACKAGE_NAMES, json!(["lib", "app"]))]);

        toolchain.prepare(&mut spec).unwrap();

        assert_eq!(
            spec.get_string_list(core_keys::MODULE_REGISTRY_NAMES),
            vec!["widgets", "unit"]
        );
        assert_eq!(
            spec.get_string_list(core_keys::TEST_MODULE_PATHS),
            vec!["/t/widgets.js", "/t/unit_a.js", "/t/unit_b.js"]
        );
    }

    #[test]
    fn test_explicit_registries_win() {
        let toolchain = TestToolchain::new(extensions());
        let mut spec = Spec::from_entries([
            (core_keys::TEST_REGISTRY_NAMES, json!(["unit"])),
            (core_keys::TEST_PACKAGE_NAMES, json!(["lib"])),
        ]);

        toolchain.prepare(&mut spec).unwrap();

        assert_eq!(spec.get_string_list(core_keys::MODULE_REGISTRY_NAMES), vec!["unit"]);
    }

    #[test]
    fn test_existing_module_paths_kept_first() {
        let toolchain = TestToolchain::new(extensions());
        let mut spec = Spec::from_entries([
            (core_keys::TEST_REGISTRY_NAMES, json!(["unit"])),
            (core_keys::TEST_MODULE_PATHS, json!(["/t/extra.js", "/t/unit_b.js"])),
        ]);

        toolchain.prepare(&mut spec).unwrap();

        assert_eq!(
            spec.get_string_list(core_keys::TEST_MODULE_PATHS),
            vec!["/t/extra.js", "/t/unit_b.js", "/t/unit_a.js"]
        );
    }

    #[test]
    fn test_other_stages_leave_spec_alone() {
        let toolchain = KarmaToolchain::new(extensions());
        let mut spec = Spec::from_entries([("custom", json!(1))]);
        let before = spec.clone();

        toolchain.compile(&mut spec).unwrap();
        toolchain.assemble(&mut spec).unwrap();
        toolchain.link(&mut spec).unwrap();

        assert_eq!(spec, before);
    }

    #[test]
    fn test_karma_prepare_applies_coverage() {
        let toolchain = KarmaToolchain::new(extensions());
        let mut spec = Spec::from_entries([
            (keys::COVER_TEST, json!(true)),
            ("custom", json!("kept")),
        ]);

        toolchain.prepare(&mut spec).unwrap();

        assert_eq!(spec.get_bool(keys::COVERAGE_ENABLE), Some(false));
        assert_eq!(spec.get_str(keys::COVERAGE_TYPE), Some("lcov"));
        assert_eq!(spec.get_bool(keys::COVER_TEST), Some(true));
        assert_eq!(spec.get_str("custom"), Some("kept"));
        assert!(spec.get_string_list(core_keys::MODULE_REGISTRY_NAMES).is_empty());
    }

    #[test]
    fn test_default_karma_toolchain_has_no_coverage_reporter() {
        let toolchain = KarmaToolchain::new(extensions());
        let mut spec = Spec::from_entries([(core_keys::SOURCE_ARTIFACTS, json!(["/b/bundle.js"]))]);

        toolchain.prepare(&mut spec).unwrap();
        let config = build_config(&spec);

        assert!(!config.reporters.contains(&"coverage".to_string()));
        assert!(config.coverage_reporter.is_none());
        assert!(config.preprocessors.is_empty());
    }

    #[test]
    fn test_wrapped_toolchain_runs_after_test_resolution() {
        let toolchain = TestToolchain::wrapping(extensions(), Arc::new(NullToolchain));
        let mut spec = Spec::from_entries([(core_keys::TEST_PACKAGE_NAMES, json!(["lib"]))]);

        for stage in stagehand_core::Stage::ALL {
            toolchain.execute(stage, &mut spec).unwrap();
        }

        assert_eq!(toolchain.name(), "null");
        assert_eq!(
            spec.get_string_list(core_keys::TEST_MODULE_PATHS),
            vec!["/t/widgets.js", "/t/unit_a.js"]
        );
        assert_eq!(spec.get_str("prepare"), Some("prepared"));
        assert_eq!(spec.get_str("link"), Some("linked"));
    }
}
