//! External runner driver.
//!
//! Translates the Spec into a Karma configuration file, launches the runner
//! as a subprocess, and writes the outcome back into the Spec.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use stagehand_core::extension::BUILD_DIR_ENV;
use stagehand_core::{AdviceError, LaunchFailure, Spec};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{self, CoverageConfig, KARMA_CONF_JS};
use crate::keys;
use crate::outcome::{EmptyRunPolicy, RunOutcome, RunSummary};

/// Environment variable naming where the runner may write its summary.
pub const RESULT_FILE_ENV: &str = "STAGEHAND_RESULT_FILE";

/// Errors produced by a runner driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Launch(#[from] LaunchFailure),

    #[error("no build directory set; cannot place {0}")]
    MissingBuildDir(&'static str),

    #[error("runner command is empty")]
    EmptyCommand,

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read runner result {path}: {source}")]
    ReadResult {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed runner result {path}: {source}")]
    ParseResult {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize karma config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("runner wait failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DriverError> for AdviceError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Launch(failure) => AdviceError::Launch(failure),
            other => AdviceError::Failed(anyhow::Error::new(other)),
        }
    }
}

/// Capability to configure and run an external test runner.
#[async_trait]
pub trait RunnerDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Derive and write the runner configuration; returns its path.
    ///
    /// Must be idempotent for the same Spec input.
    fn setup(&self, spec: &mut Spec) -> Result<PathBuf, DriverError>;

    /// Run the external process and record the outcome in the Spec.
    ///
    /// The configuration is re-derived from the Spec first, so changes made
    /// after the initial `setup` reach the runner.
    async fn run(&self, spec: &mut Spec) -> Result<RunOutcome, DriverError>;
}

/// Driver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KarmaDriverConfig {
    /// Command prefix; the config path is appended as the last argument.
    pub command: Vec<String>,

    /// Summary file name, relative to the build directory.
    pub result_file: String,

    pub empty_run_policy: EmptyRunPolicy,
}

impl Default for KarmaDriverConfig {
    fn default() -> Self {
        Self {
            command: vec!["karma".to_string(), "start".to_string()],
            result_file: "karma-result.json".to_string(),
            empty_run_policy: EmptyRunPolicy::default(),
        }
    }
}

impl KarmaDriverConfig {
    /// Use a different command prefix.
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_empty_run_policy(mut self, policy: EmptyRunPolicy) -> Self {
        self.empty_run_policy = policy;
        self
    }
}

/// Driver for the Karma test runner.
#[derive(Debug, Clone, Default)]
pub struct KarmaDriver {
    config: KarmaDriverConfig,
}

impl KarmaDriver {
    pub fn new(config: KarmaDriverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KarmaDriverConfig {
        &self.config
    }

    fn build_dir(spec: &Spec, what: &'static str) -> Result<PathBuf, DriverError> {
        spec.build_dir()
            .map(Path::to_path_buf)
            .ok_or(DriverError::MissingBuildDir(what))
    }

    fn read_summary(path: &Path) -> Result<Option<RunSummary>, DriverError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(DriverError::ReadResult {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| DriverError::ParseResult {
                path: path.display().to_string(),
                source,
            })
    }

    /// Coverage directories are resolved against the build directory.
    fn coverage_artifacts(spec: &Spec, build_dir: &Path) -> Vec<PathBuf> {
        CoverageConfig::from_spec(spec)
            .map(|coverage| build_dir.join(coverage.dir))
            .filter(|dir| dir.exists())
            .into_iter()
            .collect()
    }
}

#[async_trait]
impl RunnerDriver for KarmaDriver {
    fn name(&self) -> &str {
        "karma"
    }

    fn setup(&self, spec: &mut Spec) -> Result<PathBuf, DriverError> {
        let build_dir = Self::build_dir(spec, KARMA_CONF_JS)?;

        let karma_config = config::build_config(spec);
        let overrides = spec.get(keys::KARMA_CONFIG_OVERRIDES);
        let value = config::config_value(&karma_config, overrides.as_ref())?;
        let rendered = config::render(&value)?;
        let digest = config::digest(&rendered);

        let path = build_dir.join(KARMA_CONF_JS);
        let unchanged = std::fs::read_to_string(&path)
            .map(|existing| existing == rendered)
            .unwrap_or(false);
        if !unchanged {
            std::fs::create_dir_all(&build_dir).map_err(|source| DriverError::Write {
                path: build_dir.display().to_string(),
                source,
            })?;
            std::fs::write(&path, &rendered).map_err(|source| DriverError::Write {
                path: path.display().to_string(),
                source,
            })?;
        }

        debug!(path = %path.display(), digest = %digest, "Wrote karma configuration");
        spec.set(keys::KARMA_CONFIG, value);
        spec.set(keys::KARMA_CONFIG_PATH, path.to_string_lossy().into_owned());
        spec.set(keys::KARMA_CONFIG_DIGEST, digest);
        Ok(path)
    }

    async fn run(&self, spec: &mut Spec) -> Result<RunOutcome, DriverError> {
        let config_path = self.setup(spec)?;
        let build_dir = Self::build_dir(spec, "the runner result file")?;
        let result_path = build_dir.join(&self.config.result_file);
        if result_path.exists() {
            std::fs::remove_file(&result_path)?;
        }

        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or(DriverError::EmptyCommand)?;

        let run_id = Uuid::new_v4();
        info!(
            run_id = %run_id,
            command = ?self.config.command,
            config = %config_path.display(),
            "Launching test runner"
        );

        let started_at = Utc::now();
        let status = Command::new(program)
            .args(args)
            .arg(&config_path)
            .env(BUILD_DIR_ENV, &build_dir)
            .env(RESULT_FILE_ENV, &result_path)
            .status()
            .await
            .map_err(|source| LaunchFailure {
                program: program.clone(),
                source,
            })?;
        let finished_at = Utc::now();

        let return_code = status.code().unwrap_or(-1);
        let summary = Self::read_summary(&result_path)?;
        let passed = RunOutcome::judge(return_code, summary.as_ref(), self.config.empty_run_policy);
        let artifacts = if passed {
            Self::coverage_artifacts(spec, &build_dir)
        } else {
            Vec::new()
        };

        let outcome = RunOutcome {
            run_id,
            return_code,
            passed,
            summary,
            started_at,
            finished_at,
            artifacts,
        };
        outcome.write_to(spec);

        if passed {
            info!(run_id = %run_id, return_code, duration_ms = outcome.duration_ms(), "Test run passed");
        } else {
            warn!(run_id = %run_id, return_code, duration_ms = outcome.duration_ms(), "Test run failed");
        }
        Ok(outcome)
    }
}
