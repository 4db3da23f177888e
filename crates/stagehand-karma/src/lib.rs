//! Stagehand Karma - browser test runs on the staged pipeline
//!
//! Builds on `stagehand-core`:
//! - [`TestToolchain`] and [`KarmaToolchain`] resolve test registries into
//!   module paths during `prepare`
//! - [`KarmaDriver`] writes `karma.conf.js` and runs the external runner
//! - [`AbortController`] turns a failed run into a pipeline abort
//! - [`KarmaRuntime`] wires these together from [`RunOptions`]

pub mod abort;
pub mod advice;
pub mod config;
pub mod driver;
pub mod outcome;
pub mod runtime;
pub mod toolchain;

pub use abort::AbortController;
pub use advice::{RunnerAdvice, SetupAdvice};
pub use config::{CoverageConfig, KarmaConfig};
pub use driver::{DriverError, KarmaDriver, KarmaDriverConfig, RunnerDriver};
pub use outcome::{EmptyRunPolicy, RecordedOutcome, RunOutcome, RunSummary};
pub use runtime::{KarmaRuntime, RunOptions, RunReport};
pub use toolchain::{KarmaToolchain, TestToolchain};

/// Spec keys written or read by the karma integration.
pub mod keys {
    pub const KARMA_CONFIG: &str = "karma_config";
    pub const KARMA_CONFIG_PATH: &str = "karma_config_path";
    pub const KARMA_CONFIG_DIGEST: &str = "karma_config_digest";
    /// Object shallow-merged over the generated configuration.
    pub const KARMA_CONFIG_OVERRIDES: &str = "karma_config_overrides";
    pub const KARMA_BROWSERS: &str = "karma_browsers";

    pub const KARMA_RETURN_CODE: &str = "karma_return_code";
    pub const KARMA_TEST_PASSED: &str = "karma_test_passed";
    pub const KARMA_RUN_SUMMARY: &str = "karma_run_summary";
    pub const KARMA_RUN_ID: &str = "karma_run_id";
    pub const KARMA_STARTED_AT: &str = "karma_started_at";
    pub const KARMA_FINISHED_AT: &str = "karma_finished_at";

    pub const COVERAGE_ENABLE: &str = "coverage_enable";
    pub const COVERAGE_DIR: &str = "coverage_dir";
    pub const COVERAGE_TYPE: &str = "coverage_type";
    pub const COVER_BUNDLE: &str = "cover_bundle";
    pub const COVER_TEST: &str = "cover_test";
    /// Only present after a passing run.
    pub const COVERAGE_REPORTS: &str = "coverage_reports";
}
