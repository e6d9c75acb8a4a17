//! CLI command definitions for testrunctl.
//!
//! `runs submit` drives a batch through the remote API, `runs submit-local`
//! runs every test as a local child process, and `runs prepare` writes a
//! portfolio for later use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{InterruptibleSleeper, SystemTimeService, TimeService, TimedSleeper};
use crate::config::{current_user, SubmitDefaults};
use crate::error::{LaunchError, SubmitError};
use crate::launcher::local::{DEFAULT_FRAMEWORK_VERSION, DEFAULT_REMOTE_MAVEN};
use crate::launcher::{
    Launcher, LocalLaunchConfig, LocalLauncher, RemoteLauncher, RemoteLauncherConfig,
};
use crate::runs::overrides::{default_override_files, split_file_list};
use crate::runs::portfolio::ensure_not_empty;
use crate::runs::{
    build_override_map, count_failed, final_report, read_portfolio, write_json_report,
    write_portfolio, write_yaml_report, Portfolio, RunSubmissionScheduler, SchedulerConfig,
};

/// Submit automated test runs and wait for their results.
#[derive(Parser)]
#[command(name = "testrunctl")]
#[command(about = "Submit test runs to an ecosystem or local JVMs and report the results")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Also write the log to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Work with test runs.
    Runs(RunsArgs),
}

#[derive(Parser, Debug)]
pub struct RunsArgs {
    #[command(subcommand)]
    pub command: RunsSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum RunsSubcommand {
    /// Submit tests to the ecosystem and wait for them to finish.
    Submit(SubmitArgs),

    /// Run tests as local child processes and wait for them to finish.
    #[command(name = "submit-local")]
    SubmitLocal(SubmitLocalArgs),

    /// Write the selected tests to a portfolio file.
    Prepare(PrepareArgs),
}

/// How the tests to run are chosen.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct SelectionArgs {
    /// Portfolio file listing the tests to run.
    #[arg(short = 'p', long)]
    pub portfolio: Option<PathBuf>,

    /// Test class as `<bundle>/<class>`. Repeatable.
    #[arg(long = "class")]
    pub classes: Vec<String>,

    /// Gherkin feature as a `file://` URL ending in `.feature`. Repeatable.
    #[arg(long = "gherkin")]
    pub gherkin: Vec<String>,

    /// Test stream the classes belong to.
    #[arg(short = 's', long, default_value = "")]
    pub stream: String,

    /// OBR to load the test bundles from. Repeatable.
    #[arg(long = "obr")]
    pub obrs: Vec<String>,
}

/// Flags shared by both submit commands.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct CommonArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Group to submit the runs under. A new UUID when omitted.
    #[arg(long)]
    pub group: Option<String>,

    /// Requestor recorded against each run. The current user when omitted.
    #[arg(long)]
    pub requestor: Option<String>,

    #[arg(long, default_value = "CLI")]
    pub request_type: String,

    /// Maximum runs in flight. Zero or less means no limit.
    #[arg(long, allow_negative_numbers = true)]
    pub throttle: Option<i64>,

    /// File holding the throttle; edit it to change the limit mid-batch.
    #[arg(long)]
    pub throttle_file: Option<PathBuf>,

    /// Seconds between status polls. Values below one use the default.
    #[arg(long, allow_negative_numbers = true)]
    pub poll: Option<i64>,

    /// Minutes between progress reports. Zero disables them.
    #[arg(long)]
    pub progress: Option<u64>,

    /// Minutes to wait before abandoning unfinished runs. Zero waits forever.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Override property as `key=value`. Repeatable.
    #[arg(long = "override")]
    pub overrides: Vec<String>,

    /// Properties file of overrides, `-` for none. Repeatable.
    #[arg(long = "override-file")]
    pub override_files: Vec<String>,

    #[arg(long)]
    pub report_json: Option<PathBuf>,

    #[arg(long)]
    pub report_yaml: Option<PathBuf>,

    /// Ask the framework for trace level logging.
    #[arg(long)]
    pub trace: bool,

    /// Exit successfully even when tests fail or are lost.
    #[arg(long)]
    pub no_exit_code_on_test_failures: bool,
}

#[derive(Parser, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Base URL of the ecosystem API.
    #[arg(long, env = "TESTRUN_BOOTSTRAP")]
    pub bootstrap: String,

    #[arg(long, env = "TESTRUN_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,
}

#[derive(Parser, Debug)]
pub struct SubmitLocalArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long, env = "JAVA_HOME")]
    pub java_home: PathBuf,

    /// Framework home folder.
    #[arg(long, env = "TESTRUN_HOME")]
    pub home: Option<PathBuf>,

    #[arg(long)]
    pub boot_jar: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_FRAMEWORK_VERSION)]
    pub framework_version: String,

    /// Local maven repository. `file://<user home>/.m2/repository` when omitted.
    #[arg(long)]
    pub local_maven: Option<String>,

    #[arg(long, default_value = DEFAULT_REMOTE_MAVEN)]
    pub remote_maven: String,

    #[arg(long)]
    pub bootstrap_url: Option<String>,

    /// Seconds to wait for a process to report its run name.
    #[arg(long)]
    pub detection_timeout: Option<u64>,

    /// Start each JVM with a JDWP debug agent.
    #[arg(long)]
    pub debug: bool,

    /// Debug port. Falls back to galasactl.jvm.local.launch.debug.port, then 2970.
    #[arg(long, alias = "debugPort")]
    pub debug_port: Option<u32>,

    /// `listen` or `attach`. Falls back to galasactl.jvm.local.launch.debug.mode, then listen.
    #[arg(long, alias = "debugMode")]
    pub debug_mode: Option<String>,
}

#[derive(Parser, Debug)]
pub struct PrepareArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Portfolio file to write.
    #[arg(short = 'o', long)]
    pub output: PathBuf,

    /// Override property stored against every class. Repeatable.
    #[arg(long = "override")]
    pub overrides: Vec<String>,
}

/// Parse command-line arguments into a Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Runs(args) => match args.command {
            RunsSubcommand::Submit(args) => run_submit_command(args).await?,
            RunsSubcommand::SubmitLocal(args) => run_submit_local_command(args).await?,
            RunsSubcommand::Prepare(args) => run_prepare_command(args)?,
        },
    }
    Ok(())
}

// ============================================================================
// Submit Commands
// ============================================================================

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let defaults = SubmitDefaults::from_env()?;
    let config = RemoteLauncherConfig::new(args.bootstrap).with_token(args.api_token);
    let launcher: Arc<dyn Launcher> = Arc::new(RemoteLauncher::new(config)?);
    let sleeper: Arc<dyn TimedSleeper> = Arc::new(InterruptibleSleeper::new());

    submit(&args.common, &defaults, launcher, sleeper).await?;
    Ok(())
}

async fn run_submit_local_command(args: SubmitLocalArgs) -> anyhow::Result<()> {
    let mut defaults = SubmitDefaults::from_env()?;
    if let Some(home) = &args.home {
        defaults.home = home.clone();
    }

    let config = local_launch_config(&args, &defaults.home)?;

    // Shared so a process exit can cut the poll sleep short.
    let sleeper: Arc<dyn TimedSleeper> = Arc::new(InterruptibleSleeper::new());
    let launcher: Arc<dyn Launcher> = Arc::new(LocalLauncher::new(config, sleeper.clone())?);

    submit(&args.common, &defaults, launcher, sleeper).await?;
    Ok(())
}

/// The local launch settings for `submit-local`, bootstrap included.
pub fn local_launch_config(args: &SubmitLocalArgs, home: &Path) -> Result<LocalLaunchConfig, LaunchError> {
    let local_maven = args.local_maven.clone().unwrap_or_else(default_local_maven);
    let mut config = LocalLaunchConfig::new(args.java_home.clone(), home, local_maven);
    config.remote_maven = args.remote_maven.clone();
    config.framework_version = args.framework_version.clone();
    config.boot_jar = args.boot_jar.clone();
    config.bootstrap = args.bootstrap_url.clone();
    config.detection_timeout = args.detection_timeout.map(Duration::from_secs);
    config.debug = args.debug;
    config.debug_port = args.debug_port;
    config.debug_mode = args.debug_mode.clone();
    config.load_bootstrap_properties()?;
    Ok(config)
}

fn run_prepare_command(args: PrepareArgs) -> anyhow::Result<()> {
    let mut portfolio = select_tests(&args.selection)?;
    let mut overrides = BTreeMap::new();
    for text in &args.overrides {
        let (key, value) = crate::runs::overrides::parse_override(text)?;
        overrides.insert(key, value);
    }
    for class in &mut portfolio.classes {
        class.overrides.extend(overrides.clone());
    }
    write_portfolio(&args.output, &portfolio)?;
    Ok(())
}

/// Submits the selected tests, waits for them all, and reports.
pub async fn submit(
    common: &CommonArgs,
    defaults: &SubmitDefaults,
    launcher: Arc<dyn Launcher>,
    sleeper: Arc<dyn TimedSleeper>,
) -> Result<(), SubmitError> {
    let portfolio = select_tests(&common.selection)?;
    let overrides = load_overrides(common, &defaults.home)?;

    let group = common
        .group
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let requestor = common.requestor.clone().unwrap_or_else(current_user);
    warn_if_group_in_use(launcher.as_ref(), &group).await;

    let time: Arc<dyn TimeService> = Arc::new(SystemTimeService);
    let queued = time.now().to_rfc3339();
    let ready = portfolio.ready_runs(&overrides, &requestor, &queued);

    let config = scheduler_config(common, defaults, group, requestor);
    let scheduler = RunSubmissionScheduler::new(launcher, time, sleeper, config);
    let outcome = scheduler.run(ready).await?;
    let runs = &outcome.runs;

    let report = final_report(runs);
    info!("\n{}", report);
    println!("{}", report);

    if let Some(path) = &common.report_json {
        write_json_report(path, runs)?;
    }
    if let Some(path) = &common.report_yaml {
        write_yaml_report(path, runs)?;
    }

    let failed = count_failed(runs);
    let total = runs.finished.len() + runs.lost.len();
    if failed > 0 && !common.no_exit_code_on_test_failures {
        return Err(SubmitError::TestsFailed { failed, total });
    }
    Ok(())
}

/// Builds the portfolio from either a portfolio file or the class and
/// gherkin flags. Using both is an error, as is selecting nothing.
pub fn select_tests(selection: &SelectionArgs) -> Result<Portfolio, SubmitError> {
    let from_flags = !selection.classes.is_empty() || !selection.gherkin.is_empty();

    let portfolio = match &selection.portfolio {
        Some(_) if from_flags => return Err(SubmitError::ConflictingSelection),
        Some(path) => {
            let portfolio = read_portfolio(path)?;
            ensure_not_empty(&portfolio, &path.display().to_string())?;
            portfolio
        }
        None if !from_flags => return Err(SubmitError::NoTestsSelected),
        None => {
            let obr = selection.obrs.join(",");
            let mut portfolio = Portfolio::new();
            for class in &selection.classes {
                portfolio.add_class(class, &selection.stream, &obr)?;
            }
            for url in &selection.gherkin {
                portfolio.add_gherkin(url)?;
            }
            portfolio
        }
    };

    info!(tests = portfolio.classes.len(), "Selected tests");
    Ok(portfolio)
}

fn load_overrides(common: &CommonArgs, home: &Path) -> Result<BTreeMap<String, String>, SubmitError> {
    let files = if common.override_files.is_empty() {
        default_override_files(home)
    } else {
        split_file_list(&common.override_files)
    };
    Ok(build_override_map(&files, &common.overrides)?)
}

/// Resolves the scheduler settings: flags first, then the defaults.
pub fn scheduler_config(
    common: &CommonArgs,
    defaults: &SubmitDefaults,
    group: String,
    requestor: String,
) -> SchedulerConfig {
    let poll_interval = match common.poll {
        Some(secs) if secs >= 1 => Duration::from_secs(secs.unsigned_abs()),
        _ => defaults.poll_interval,
    };
    let progress_interval = common
        .progress
        .map(|mins| Duration::from_secs(mins.saturating_mul(60)))
        .unwrap_or(defaults.progress_interval);
    let max_wait = common
        .timeout
        .filter(|mins| *mins > 0)
        .map(|mins| Duration::from_secs(mins.saturating_mul(60)));

    SchedulerConfig {
        group,
        throttle: common.throttle.unwrap_or(defaults.throttle),
        throttle_file: common.throttle_file.clone(),
        poll_interval,
        progress_interval,
        max_wait,
        fetch_method_details: common.report_json.is_some() || common.report_yaml.is_some(),
        trace: common.trace,
        request_type: common.request_type.clone(),
        requestor,
    }
}

async fn warn_if_group_in_use(launcher: &dyn Launcher, group: &str) {
    match launcher.get_runs_by_group(group).await {
        Ok(existing) if !existing.runs.is_empty() => warn!(
            group,
            runs = existing.runs.len(),
            "Group already has runs; they will be ignored"
        ),
        Ok(_) => {}
        Err(err) => warn!(group, "Could not check whether the group is in use: {}", err),
    }
}

fn default_local_maven() -> String {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_default();
    format!("file://{}", Path::new(&home).join(".m2").join("repository").display())
}
