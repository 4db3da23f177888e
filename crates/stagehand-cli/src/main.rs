//! Stagehand - staged toolchain runs from the command line
//!
//! ## Commands
//!
//! - `karma run`: prepare the test modules, write `karma.conf.js`, run the
//!   external runner and abort the pipeline if tests fail
//! - `karma null`: the same runner wrapped around the no-op toolchain
//!
//! ## Exit codes
//!
//! `0` success, `1` aborted on test failure, `2` configuration error,
//! `3` runner could not be launched, `4` any other stage or advice failure.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use stagehand_core::{ExtensionRegistry, NullToolchain, PipelineError, Toolchain};
use stagehand_karma::{
    CoverageConfig, EmptyRunPolicy, KarmaDriver, KarmaDriverConfig, KarmaRuntime, KarmaToolchain,
    RunOptions, RunReport, TestToolchain,
};
use tracing::{error, Level};

const EXIT_ABORTED: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_LAUNCH: u8 = 3;
const EXIT_FAILURE: u8 = 4;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Staged toolchain pipeline with test-runner integration", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Browser tests through the Karma runner
    Karma(KarmaArgs),
}

#[derive(Args)]
struct KarmaArgs {
    /// Keep going after failed tests instead of aborting the pipeline
    #[arg(short = 'I', long)]
    ignore_errors: bool,

    #[command(flatten)]
    tests: TestSelection,

    #[command(subcommand)]
    action: Option<KarmaAction>,
}

/// Test selection shared by every karma action.
#[derive(Args, Debug, Default)]
struct TestSelection {
    /// Test registries to run (overrides --test-package)
    #[arg(
        long = "test-registry",
        alias = "test-registries",
        global = true,
        value_delimiter = ',',
        value_name = "REGISTRY"
    )]
    test_registries: Vec<String>,

    /// Packages whose test registries should run
    #[arg(
        long = "test-package",
        alias = "test-packages",
        global = true,
        value_delimiter = ',',
        value_name = "PACKAGE"
    )]
    test_packages: Vec<String>,
}

#[derive(Subcommand)]
enum KarmaAction {
    /// Run the test pipeline
    Run(RunArgs),

    /// Run the no-op toolchain under the test runner
    Null(RunnerArgs),
}

impl KarmaAction {
    fn runner(&self) -> &RunnerArgs {
        match self {
            KarmaAction::Run(args) => &args.runner,
            KarmaAction::Null(args) => args,
        }
    }

    fn toolchain(&self, extensions: Arc<ExtensionRegistry>) -> Arc<dyn Toolchain> {
        match self {
            KarmaAction::Run(args) => {
                Arc::new(KarmaToolchain::with_coverage(extensions, args.coverage()))
            }
            KarmaAction::Null(_) => {
                Arc::new(TestToolchain::wrapping(extensions, Arc::new(NullToolchain)))
            }
        }
    }
}

/// Options for driving the runner, whatever the toolchain.
#[derive(Args, Debug, Default)]
struct RunnerArgs {
    /// Source artifacts, separated by the platform path separator (repeatable)
    #[arg(long = "artifact", alias = "artifacts", value_name = "PATHS")]
    artifacts: Vec<String>,

    /// Advices to run before the runner, in order
    #[arg(long, value_delimiter = ',', value_name = "ADVICES")]
    before_karma: Vec<String>,

    /// Frameworks added to the generated configuration
    #[arg(long, value_delimiter = ',', value_name = "FRAMEWORKS")]
    extra_frameworks: Vec<String>,

    /// Package contributing additional advices
    #[arg(short = 't', long, value_name = "PKG")]
    toolchain_package: Option<String>,

    /// Build directory (a temporary one is used when omitted)
    #[arg(long, env = "STAGEHAND_BUILD_DIR")]
    build_dir: Option<PathBuf>,

    /// Extension manifest (TOML)
    #[arg(long, env = "STAGEHAND_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Browsers to launch
    #[arg(long, value_delimiter = ',', value_name = "BROWSERS")]
    browsers: Vec<String>,

    /// Runner command prefix, e.g. "npx karma start"
    #[arg(long, env = "STAGEHAND_KARMA_BIN", value_name = "ARGV")]
    karma_bin: Option<String>,

    /// How to judge a run that executed no tests
    #[arg(long, default_value_t = EmptyRunPolicy::Runner)]
    empty_run_policy: EmptyRunPolicy,

    /// Print the final Spec as JSON
    #[arg(long)]
    dump_spec: bool,
}

impl RunnerArgs {
    fn options(&self, ignore_errors: bool, tests: &TestSelection) -> RunOptions {
        RunOptions {
            test_registry_names: non_empty(&tests.test_registries),
            test_package_names: non_empty(&tests.test_packages),
            source_artifacts: (!self.artifacts.is_empty())
                .then(|| split_artifacts(&self.artifacts)),
            before_karma_advice_list: non_empty(&self.before_karma),
            extra_frameworks: non_empty(&self.extra_frameworks),
            toolchain_package: self.toolchain_package.clone(),
            abort_on_test_failure: ignore_errors.then_some(false),
            build_dir: self.build_dir.clone(),
            browsers: non_empty(&self.browsers),
        }
    }

    fn driver_config(&self) -> Result<KarmaDriverConfig> {
        let mut config = KarmaDriverConfig::default().with_empty_run_policy(self.empty_run_policy);
        if let Some(bin) = &self.karma_bin {
            let argv: Vec<&str> = bin.split_whitespace().collect();
            anyhow::ensure!(!argv.is_empty(), "--karma-bin must not be empty");
            config = config.with_command(argv);
        }
        Ok(config)
    }
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    #[command(flatten)]
    runner: RunnerArgs,

    /// Collect coverage
    #[arg(long)]
    coverage: bool,

    /// Coverage report directory, relative to the build directory
    #[arg(long, default_value = "coverage")]
    coverage_dir: String,

    /// Coverage report type
    #[arg(long, default_value = "lcov")]
    coverage_type: String,

    /// Also instrument test modules
    #[arg(long)]
    cover_test: bool,

    /// Do not instrument source artifacts
    #[arg(long)]
    no_cover_bundle: bool,
}

impl RunArgs {
    fn coverage(&self) -> CoverageConfig {
        CoverageConfig {
            enable: self.coverage,
            dir: self.coverage_dir.clone(),
            report_type: self.coverage_type.clone(),
            cover_bundle: !self.no_cover_bundle,
            cover_test: self.cover_test,
        }
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

/// Flatten path-separator delimited artifact lists, keeping order.
fn split_artifacts(values: &[String]) -> Vec<PathBuf> {
    values
        .iter()
        .flat_map(|value| std::env::split_paths(value))
        .filter(|path| !path.as_os_str().is_empty())
        .collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    stagehand_core::init_tracing(cli.json_logs, level);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "Configuration error");
            eprintln!("Error: {:#}", err);
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Karma(karma) => match &karma.action {
            Some(action) => cmd_karma(action, &karma).await,
            None => {
                let mut command = Cli::command();
                if let Some(karma) = command.find_subcommand_mut("karma") {
                    karma.print_help()?;
                }
                Ok(ExitCode::SUCCESS)
            }
        },
    }
}

async fn cmd_karma(action: &KarmaAction, karma: &KarmaArgs) -> Result<ExitCode> {
    let args = action.runner();
    let extensions = Arc::new(load_extensions(args.manifest.as_deref())?);
    let driver = KarmaDriver::new(args.driver_config()?);
    let toolchain = action.toolchain(extensions.clone());
    let runtime = KarmaRuntime::new(Arc::new(driver), extensions);

    let spec = args.options(karma.ignore_errors, &karma.tests).to_spec();
    let report = runtime.run(toolchain, spec).await;

    print_report(&report);
    if args.dump_spec {
        println!("{}", serde_json::to_string_pretty(&report.spec)?);
    }
    Ok(ExitCode::from(exit_code(&report)))
}

fn load_extensions(manifest: Option<&Path>) -> Result<ExtensionRegistry> {
    match manifest {
        Some(path) => ExtensionRegistry::load(path)
            .with_context(|| format!("Failed to load manifest {}", path.display())),
        None => Ok(ExtensionRegistry::new()),
    }
}

fn exit_code(report: &RunReport) -> u8 {
    match &report.result {
        Ok(()) => 0,
        Err(err) if err.is_abort() => EXIT_ABORTED,
        Err(PipelineError::Config(_) | PipelineError::Manifest(_)) => EXIT_CONFIG,
        Err(err) if err.is_launch_failure() => EXIT_LAUNCH,
        Err(_) => EXIT_FAILURE,
    }
}

fn print_report(report: &RunReport) {
    if let Some(run_id) = report.run_id {
        println!("Run ID: {}", run_id);
    }
    println!("State: {}", report.state);
    if let Some(outcome) = report.outcome() {
        println!(
            "Tests: {} (return code {})",
            if outcome.passed { "✓ PASSED" } else { "✗ FAILED" },
            outcome.return_code
        );
    }
    if let Err(err) = &report.result {
        eprintln!("Error: {}", err);
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            eprintln!("  caused by: {}", cause);
            source = cause.source();
        }
    }
}
