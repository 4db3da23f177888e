//! Karma configuration generation.

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use stagehand_core::{keys as core_keys, Spec};

use crate::driver::RESULT_FILE_ENV;
use crate::keys;

/// File name of the generated configuration inside the build directory.
pub const KARMA_CONF_JS: &str = "karma.conf.js";

pub const COVERAGE_TYPE_DEFAULT: &str = "lcov";
pub const COVERAGE_DIR_DEFAULT: &str = "coverage";

/// Reporter defined inline by the rendered configuration. It writes the run
/// summary to the path named by [`RESULT_FILE_ENV`].
pub const RESULT_REPORTER: &str = "stagehand-result";

const RESULT_REPORTER_JS: &str = r#"function StagehandResultReporter(baseReporterDecorator) {
    baseReporterDecorator(this);
    this.adapters = [];
    var skipped = 0;
    this.onSpecComplete = function(browser, result) {
        if (result.skipped) {
            skipped += 1;
        }
    };
    this.onRunComplete = function(browsers, results) {
        var file = process.env.@RESULT_FILE_ENV@;
        if (!file) {
            return;
        }
        require('fs').writeFileSync(file, JSON.stringify({
            executed: results.success + results.failed,
            passed: results.success,
            failed: results.failed,
            skipped: skipped
        }));
    };
}
StagehandResultReporter.$inject = ['baseReporterDecorator'];
"#;

/// The configuration object handed to `config.set(...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KarmaConfig {
    pub base_url: String,
    pub frameworks: Vec<String>,
    pub reporters: Vec<String>,
    pub port: u16,
    pub colors: bool,
    pub log_level: String,
    pub browsers: Vec<String>,
    pub capture_timeout: u64,
    pub single_run: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub preprocessors: IndexMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_reporter: Option<CoverageReporter>,
}

impl Default for KarmaConfig {
    fn default() -> Self {
        Self {
            base_url: "./".to_string(),
            frameworks: ["mocha", "chai", "expect", "sinon"].map(String::from).to_vec(),
            reporters: ["spec", "progress", RESULT_REPORTER].map(String::from).to_vec(),
            port: 9876,
            colors: true,
            log_level: "INFO".to_string(),
            browsers: vec!["PhantomJS".to_string()],
            capture_timeout: 60_000,
            single_run: true,
            files: Vec::new(),
            preprocessors: IndexMap::new(),
            coverage_reporter: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReporter {
    #[serde(rename = "type")]
    pub report_type: String,
    pub dir: String,
}

/// Coverage flags, fixed per toolchain and mirrored into the Spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageConfig {
    pub enable: bool,
    pub dir: String,
    pub report_type: String,
    /// Instrument the source artifacts.
    pub cover_bundle: bool,
    /// Instrument the test modules.
    pub cover_test: bool,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            enable: false,
            dir: COVERAGE_DIR_DEFAULT.to_string(),
            report_type: COVERAGE_TYPE_DEFAULT.to_string(),
            cover_bundle: true,
            cover_test: false,
        }
    }
}

impl CoverageConfig {
    /// Read coverage settings from the Spec; `None` unless enabled.
    pub fn from_spec(spec: &Spec) -> Option<Self> {
        if !spec.get_bool(keys::COVERAGE_ENABLE).unwrap_or(false) {
            return None;
        }
        Some(Self {
            enable: true,
            dir: spec
                .get_str(keys::COVERAGE_DIR)
                .unwrap_or(COVERAGE_DIR_DEFAULT)
                .to_string(),
            report_type: spec
                .get_str(keys::COVERAGE_TYPE)
                .unwrap_or(COVERAGE_TYPE_DEFAULT)
                .to_string(),
            cover_bundle: spec.get_bool(keys::COVER_BUNDLE).unwrap_or(true),
            cover_test: spec.get_bool(keys::COVER_TEST).unwrap_or(false),
        })
    }

    /// Write the settings into the Spec without overwriting existing keys.
    pub fn apply_defaults(&self, spec: &mut Spec) {
        let entries = [
            (keys::COVERAGE_ENABLE, Value::from(self.enable)),
            (keys::COVERAGE_DIR, Value::from(self.dir.as_str())),
            (keys::COVERAGE_TYPE, Value::from(self.report_type.as_str())),
            (keys::COVER_BUNDLE, Value::from(self.cover_bundle)),
            (keys::COVER_TEST, Value::from(self.cover_test)),
        ];
        for (key, value) in entries {
            if !spec.contains(key) {
                spec.set(key, value);
            }
        }
    }
}

/// Derive the configuration for a Spec.
pub fn build_config(spec: &Spec) -> KarmaConfig {
    let mut config = KarmaConfig::default();

    for framework in spec.extra_frameworks() {
        if !config.frameworks.contains(framework) {
            config.frameworks.push(framework.clone());
        }
    }

    let browsers = spec.get_string_list(keys::KARMA_BROWSERS);
    if !browsers.is_empty() {
        config.browsers = browsers;
    }

    let artifacts: Vec<String> = spec.source_artifacts().iter().map(display_path).collect();
    let tests: Vec<String> = spec
        .get_path_list(core_keys::TEST_MODULE_PATHS)
        .iter()
        .map(display_path)
        .collect();

    if let Some(coverage) = CoverageConfig::from_spec(spec) {
        config.reporters.push("coverage".to_string());
        config.coverage_reporter = Some(CoverageReporter {
            report_type: coverage.report_type.clone(),
            dir: coverage.dir.clone(),
        });
        let instrumented = artifacts
            .iter()
            .filter(|_| coverage.cover_bundle)
            .chain(tests.iter().filter(|_| coverage.cover_test));
        for file in instrumented {
            config
                .preprocessors
                .insert(file.clone(), vec!["coverage".to_string()]);
        }
    }

    config.files = artifacts.into_iter().chain(tests).collect();
    config
}

/// Serialize `config` and shallow-merge `overrides` on top.
pub fn config_value(config: &KarmaConfig, overrides: Option<&Value>) -> serde_json::Result<Value> {
    let mut value = serde_json::to_value(config)?;
    if let (Value::Object(base), Some(Value::Object(extra))) = (&mut value, overrides) {
        for (key, entry) in extra {
            base.insert(key.clone(), entry.clone());
        }
    }
    Ok(value)
}

/// Render the configuration module consumed by Karma.
///
/// The module also registers the result reporter as an inline plugin, next
/// to whatever plugins Karma would load by default.
pub fn render(config: &Value) -> serde_json::Result<String> {
    let body = serde_json::to_string_pretty(config)?.replace('\n', "\n    ");
    let reporter = RESULT_REPORTER_JS.replace("@RESULT_FILE_ENV@", RESULT_FILE_ENV);
    Ok(format!(
        "{reporter}\n\
         module.exports = function(config) {{\n    \
         config.set({body});\n    \
         config.set({{\n        \
         plugins: (config.plugins || ['karma-*']).concat([\n            \
         {{'reporter:{name}': ['type', StagehandResultReporter]}}\n        \
         ])\n    \
         }});\n\
         }}\n",
        reporter = reporter,
        body = body,
        name = RESULT_REPORTER,
    ))
}

/// Hex sha256 of rendered configuration content.
pub fn digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn display_path(path: impl AsRef<Path>) -> String {
    path.as_ref().to_string_lossy().into_owned()
}
