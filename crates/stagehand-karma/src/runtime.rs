//! Run entry point: options to Spec, advice wiring and the build directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stagehand_core::{
    keys as core_keys, Advice, AdviceRegistry, Event, ExtensionRegistry, Pipeline, PipelineError,
    PipelineState, Spec, Stage, Toolchain,
};
use tempfile::TempDir;
use tracing::{info, warn};
use uuid::Uuid;

use crate::abort::AbortController;
use crate::advice::{RunnerAdvice, SetupAdvice};
use crate::driver::RunnerDriver;
use crate::keys;
use crate::outcome::RecordedOutcome;

/// Per-invocation options, as gathered by a front end.
///
/// Every field is optional; absent options leave no key in the Spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    pub test_registry_names: Option<Vec<String>>,
    pub test_package_names: Option<Vec<String>>,
    pub source_artifacts: Option<Vec<PathBuf>>,
    pub before_karma_advice_list: Option<Vec<String>>,
    pub extra_frameworks: Option<Vec<String>>,
    pub toolchain_package: Option<String>,
    pub abort_on_test_failure: Option<bool>,
    pub build_dir: Option<PathBuf>,
    pub browsers: Option<Vec<String>>,
}

impl RunOptions {
    /// Build a fresh Spec from these options.
    pub fn to_spec(&self) -> Spec {
        let mut spec = Spec::new();
        self.apply_to(&mut spec);
        spec
    }

    /// Write these options into `spec`, popping keys whose option is absent.
    ///
    /// Artifact paths are canonicalised; paths that do not exist are dropped
    /// with a warning and the remaining order is kept.
    pub fn apply_to(&self, spec: &mut Spec) {
        let artifacts = self.source_artifacts.as_deref().map(existing_artifacts);

        put(spec, core_keys::TEST_REGISTRY_NAMES, self.test_registry_names.as_ref());
        put(spec, core_keys::TEST_PACKAGE_NAMES, self.test_package_names.as_ref());
        put(spec, core_keys::SOURCE_ARTIFACTS, artifacts.as_ref());
        put(
            spec,
            core_keys::BEFORE_KARMA_ADVICE_LIST,
            self.before_karma_advice_list.as_ref(),
        );
        put(spec, core_keys::EXTRA_FRAMEWORKS, self.extra_frameworks.as_ref());
        put(spec, core_keys::TOOLCHAIN_PACKAGE, self.toolchain_package.as_ref());
        put(spec, core_keys::ABORT_ON_TEST_FAILURE, self.abort_on_test_failure.as_ref());
        put(spec, core_keys::BUILD_DIR, self.build_dir.as_ref());
        put(spec, keys::KARMA_BROWSERS, self.browsers.as_ref());
    }
}

fn put<T: Serialize>(spec: &mut Spec, key: &str, value: Option<&T>) {
    match value.and_then(|v| serde_json::to_value(v).ok()) {
        Some(value) => spec.set(key, value),
        None => {
            spec.pop(key);
        }
    }
}

fn existing_artifacts(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths
        .iter()
        .filter_map(|path| match std::fs::canonicalize(path) {
            Ok(resolved) => Some(resolved),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Skipping missing source artifact");
                None
            }
        })
        .collect()
}

/// Everything a caller may want to inspect after a run.
#[derive(Debug)]
pub struct RunReport {
    pub spec: Spec,
    pub state: PipelineState,
    /// `None` when the run failed before a pipeline was built.
    pub run_id: Option<Uuid>,
    pub result: Result<(), PipelineError>,
}

impl RunReport {
    fn not_started(spec: Spec, err: PipelineError) -> Self {
        Self {
            spec,
            state: PipelineState::NotStarted,
            run_id: None,
            result: Err(err),
        }
    }

    /// The recorded test outcome, if the runner got that far.
    pub fn outcome(&self) -> Option<RecordedOutcome> {
        RecordedOutcome::read(&self.spec)
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Wires a runner driver and an extension registry into pipeline runs.
#[derive(Clone)]
pub struct KarmaRuntime {
    driver: Arc<dyn RunnerDriver>,
    extensions: Arc<ExtensionRegistry>,
}

impl KarmaRuntime {
    pub fn new(driver: Arc<dyn RunnerDriver>, extensions: Arc<ExtensionRegistry>) -> Self {
        Self { driver, extensions }
    }

    pub fn extensions(&self) -> &Arc<ExtensionRegistry> {
        &self.extensions
    }

    /// Resolve every advice the Spec names and bind them to a new pipeline.
    ///
    /// Unknown advice or package identifiers fail here, before any stage.
    pub fn build_pipeline(
        &self,
        toolchain: Arc<dyn Toolchain>,
        spec: &Spec,
    ) -> Result<Pipeline, PipelineError> {
        let mut hooks = AdviceRegistry::new();
        for name in spec.before_karma_advice_list() {
            hooks.register(Event::BeforeKarma, self.extensions.resolve_advice(name)?);
        }

        let package_advices = match spec.toolchain_package() {
            Some(package) => self.extensions.package_advices(package)?,
            None => Vec::new(),
        };

        let mut advices = AdviceRegistry::new();
        advices.register(
            Event::After(Stage::Prepare),
            Arc::new(SetupAdvice::new(self.driver.clone())),
        );

        let mut deferred = Vec::new();
        for resolved in package_advices {
            if matches!(resolved.event, Event::BeforeKarma | Event::AfterKarma) {
                bind(&mut hooks, resolved.event, resolved.advice, resolved.priority);
            } else {
                deferred.push(resolved);
            }
        }

        advices.register(
            Event::Before(Stage::Compile),
            Arc::new(RunnerAdvice::with_hooks(self.driver.clone(), hooks)),
        );
        advices.register(Event::Before(Stage::Compile), Arc::new(AbortController));
        for resolved in deferred {
            bind(&mut advices, resolved.event, resolved.advice, resolved.priority);
        }

        Ok(Pipeline::with_advices(toolchain, advices))
    }

    /// Run `toolchain` against `spec` with the karma advices bound.
    ///
    /// Without an explicit build directory a temporary one is created and
    /// removed when the run ends, whatever the result.
    pub async fn run(&self, toolchain: Arc<dyn Toolchain>, mut spec: Spec) -> RunReport {
        let mut pipeline = match self.build_pipeline(toolchain, &spec) {
            Ok(pipeline) => pipeline,
            Err(err) => return RunReport::not_started(spec, err),
        };

        let _temp_dir = match prepare_build_dir(&mut spec) {
            Ok(temp_dir) => temp_dir,
            Err(err) => return RunReport::not_started(spec, err),
        };

        info!(
            run_id = %pipeline.run_id(),
            driver = self.driver.name(),
            build_dir = ?spec.build_dir(),
            "Starting test run"
        );
        let result = pipeline.run(&mut spec).await;

        RunReport {
            spec,
            state: pipeline.state(),
            run_id: Some(pipeline.run_id()),
            result,
        }
    }
}

impl std::fmt::Debug for KarmaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KarmaRuntime")
            .field("driver", &self.driver.name())
            .field("extensions", &self.extensions)
            .finish()
    }
}

fn bind(
    registry: &mut AdviceRegistry,
    event: Event,
    advice: Arc<dyn Advice>,
    priority: Option<i64>,
) {
    match priority {
        Some(priority) => registry.register_with_priority(event, advice, priority),
        None => registry.register(event, advice),
    }
}

/// Ensure the Spec has a build directory, creating a temporary one if needed.
fn prepare_build_dir(spec: &mut Spec) -> Result<Option<TempDir>, PipelineError> {
    if let Some(dir) = spec.build_dir() {
        create_dir(dir)?;
        return Ok(None);
    }

    let temp_dir = tempfile::Builder::new()
        .prefix("stagehand-")
        .tempdir()
        .map_err(|err| PipelineError::Config(format!("cannot create build directory: {err}")))?;
    spec.set_build_dir(temp_dir.path().to_path_buf());
    Ok(Some(temp_dir))
}

fn create_dir(dir: &Path) -> Result<(), PipelineError> {
    std::fs::create_dir_all(dir).map_err(|err| {
        PipelineError::Config(format!(
            "cannot create build directory {}: {err}",
            dir.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{KarmaDriver, KarmaDriverConfig};
    use serde_json::json;
    use stagehand_core::{advice_fn, ExtensionManifest, ManifestError, NullToolchain};

    fn runtime(extensions: ExtensionRegistry) -> KarmaRuntime {
        let driver = KarmaDriver::new(KarmaDriverConfig::default().with_command(["true"]));
        KarmaRuntime::new(Arc::new(driver), Arc::new(extensions))
    }

    #[test]
    fn test_absent_options_are_popped() {
        let mut spec = Spec::from_entries([
            (core_keys::TOOLCHAIN_PACKAGE, json!("stale")),
            ("custom", json!(true)),
        ]);
        RunOptions {
            extra_frameworks: Some(vec!["jasmine".into()]),
            ..RunOptions::default()
        }
        .apply_to(&mut spec);

        assert!(!spec.contains(core_keys::TOOLCHAIN_PACKAGE));
        assert_eq!(spec.extra_frameworks(), ["jasmine".to_string()]);
        assert_eq!(spec.get_bool("custom"), Some(true));
        assert_eq!(spec.get(core_keys::ABORT_ON_TEST_FAILURE), None);
    }

    #[test]
    fn test_missing_artifacts_dropped_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let b = dir.path().join("b.js");
        let a = dir.path().join("a.js");
        std::fs::write(&b, "").unwrap();
        std::fs::write(&a, "").unwrap();

        let spec = RunOptions {
            source_artifacts: Some(vec![b.clone(), dir.path().join("gone.js"), a.clone()]),
            ..RunOptions::default()
        }
        .to_spec();

        assert_eq!(
            spec.source_artifacts(),
            [b.canonicalize().unwrap(), a.canonicalize().unwrap()]
        );
    }

    #[test]
    fn test_unknown_advice_fails_before_any_stage() {
        let runtime = runtime(ExtensionRegistry::new());
        let spec = Spec::from_entries([(core_keys::BEFORE_KARMA_ADVICE_LIST, json!(["nope"]))]);

        let err = runtime
            .build_pipeline(Arc::new(NullToolchain), &spec)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            PipelineError::Manifest(ManifestError::UnknownAdvice(_))
        ));
    }

    #[test]
    fn test_advice_table_layout() {
        let manifest = ExtensionManifest::from_toml_str(
            r#"
[[package]]
name = "app"
advices = [
    { event = "before_karma", advice = "pkg-hook" },
    { event = "before_compile", advice = "pkg-compile" },
]
"#,
        )
        .unwrap();
        let mut extensions = ExtensionRegistry::from_manifest(manifest).unwrap();
        extensions.insert_advice("pkg-hook", advice_fn("pkg-hook", |_| Ok(())));
        extensions.insert_advice("pkg-compile", advice_fn("pkg-compile", |_| Ok(())));
        let runtime = runtime(extensions);

        let spec = Spec::from_entries([(core_keys::TOOLCHAIN_PACKAGE, json!("app"))]);
        let pipeline = runtime
            .build_pipeline(Arc::new(NullToolchain), &spec)
            .unwrap();

        assert_eq!(
            pipeline.advices().advice_names(Event::After(Stage::Prepare)),
            vec![SetupAdvice::NAME]
        );
        assert_eq!(
            pipeline.advices().advice_names(Event::Before(Stage::Compile)),
            vec![RunnerAdvice::NAME, AbortController::NAME, "pkg-compile"]
        );
    }

    #[tokio::test]
    async fn test_explicit_build_dir_is_created_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let build_dir = dir.path().join("nested").join("build");
        let spec = RunOptions {
            build_dir: Some(build_dir.clone()),
            ..RunOptions::default()
        }
        .to_spec();

        let report = runtime(ExtensionRegistry::new())
            .run(Arc::new(NullToolchain), spec)
            .await;

        assert!(report.is_success(), "{:?}", report.result);
        assert_eq!(report.state, PipelineState::Done);
        assert!(build_dir.join("karma.conf.js").is_file());
    }
}
