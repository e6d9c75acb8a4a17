//! Launcher which runs each test class in its own local child process.
//!
//! There is no server to poll. Each submission spawns a JVM, scans its
//! trace output for the run name and the result archive store, and hands
//! back a snapshot. Later status queries ask each [`LocalRunLifecycle`]
//! whether its process has exited, without ever waiting on it.

pub mod command;
pub mod lifecycle;
pub mod process;
pub mod scanner;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use self::command::{build_command, effective_overrides, parse_obrs, write_overrides_file, TestSelection};
use self::lifecycle::{read_structure_file, LocalRunLifecycle};
use self::process::{ProcessSpawner, TokioProcessSpawner};
use self::scanner::{ProcessEventSource, TracePatternSet};
use super::types::{DetailedRun, SubmitRequest, TestRunSnapshot, TestRuns};
use super::Launcher;
use crate::clock::TimedSleeper;
use crate::error::LaunchError;
use crate::runs::overrides::parse_properties;

/// Maven repository used when none is configured.
pub const DEFAULT_REMOTE_MAVEN: &str = "https://repo.maven.apache.org/maven2";

/// Framework version run when none is configured.
pub const DEFAULT_FRAMEWORK_VERSION: &str = "0.38.0";

/// Everything needed to build a local command line.
#[derive(Debug, Clone)]
pub struct LocalLaunchConfig {
    pub java_home: PathBuf,
    /// The tool's home folder; results and bootstrap live under it.
    pub home: PathBuf,
    pub local_maven: String,
    pub remote_maven: String,
    pub framework_version: String,
    /// Boot jar to run. Defaults to `<home>/lib/galasa-boot-<version>.jar`.
    pub boot_jar: Option<PathBuf>,
    /// Bootstrap URL. Defaults to `file://<home>/bootstrap.properties`.
    pub bootstrap: Option<String>,
    /// Bound on the run name and result store waits. `None` waits until the
    /// process exits.
    pub detection_timeout: Option<Duration>,
    /// Start each JVM with a JDWP debug agent.
    pub debug: bool,
    /// Zero or `None` falls back to the bootstrap, then the default port.
    pub debug_port: Option<u32>,
    /// `listen` or `attach`. `None` falls back to the bootstrap, then listen.
    pub debug_mode: Option<String>,
    /// Properties read from a local bootstrap file.
    pub bootstrap_properties: BTreeMap<String, String>,
}

impl LocalLaunchConfig {
    pub fn new(
        java_home: impl Into<PathBuf>,
        home: impl Into<PathBuf>,
        local_maven: impl Into<String>,
    ) -> Self {
        Self {
            java_home: java_home.into(),
            home: home.into(),
            local_maven: local_maven.into(),
            remote_maven: DEFAULT_REMOTE_MAVEN.to_string(),
            framework_version: DEFAULT_FRAMEWORK_VERSION.to_string(),
            boot_jar: None,
            bootstrap: None,
            detection_timeout: None,
            debug: false,
            debug_port: None,
            debug_mode: None,
            bootstrap_properties: BTreeMap::new(),
        }
    }

    pub fn boot_jar(&self) -> PathBuf {
        self.boot_jar.clone().unwrap_or_else(|| {
            self.home
                .join("lib")
                .join(format!("galasa-boot-{}.jar", self.framework_version))
        })
    }

    pub fn bootstrap_url(&self) -> String {
        self.bootstrap.clone().unwrap_or_else(|| {
            format!("file://{}", self.home.join("bootstrap.properties").display())
        })
    }

    /// Fills `bootstrap_properties` from a `file://` bootstrap.
    ///
    /// A missing file leaves them empty. Remote bootstraps are read by the
    /// framework itself, not here.
    pub fn load_bootstrap_properties(&mut self) -> Result<(), LaunchError> {
        let url = self.bootstrap_url();
        if url.starts_with("http://") || url.starts_with("https://") {
            debug!(bootstrap = %url, "Remote bootstrap, no local launch properties read");
            return Ok(());
        }
        let path = url.strip_prefix("file://").unwrap_or(&url);
        match std::fs::read_to_string(path) {
            Ok(text) => {
                self.bootstrap_properties = parse_properties(&text);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path, "No bootstrap file found");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The framework's own obr, always loaded ahead of the test obrs.
    pub fn framework_obr(&self) -> String {
        format!("mvn:dev.galasa/dev.galasa.uber.obr/{}/obr", self.framework_version)
    }
}

/// Runs tests as local child processes.
pub struct LocalLauncher {
    config: LocalLaunchConfig,
    spawner: Arc<dyn ProcessSpawner>,
    events: Arc<dyn ProcessEventSource>,
    sleeper: Arc<dyn TimedSleeper>,
    runs: Mutex<BTreeMap<String, LocalRunLifecycle>>,
}

impl LocalLauncher {
    /// A launcher spawning real processes and decoding the standard trace.
    pub fn new(config: LocalLaunchConfig, sleeper: Arc<dyn TimedSleeper>) -> Result<Self, LaunchError> {
        Ok(Self::with_parts(
            config,
            Arc::new(TokioProcessSpawner),
            Arc::new(TracePatternSet::new()?),
            sleeper,
        ))
    }

    pub fn with_parts(
        config: LocalLaunchConfig,
        spawner: Arc<dyn ProcessSpawner>,
        events: Arc<dyn ProcessEventSource>,
        sleeper: Arc<dyn TimedSleeper>,
    ) -> Self {
        Self {
            config,
            spawner,
            events,
            sleeper,
            runs: Mutex::new(BTreeMap::new()),
        }
    }

    fn runs(&self) -> MutexGuard<'_, BTreeMap<String, LocalRunLifecycle>> {
        self.runs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn prepare(&self, request: &SubmitRequest) -> Result<(LocalRunLifecycle, TestSelection), LaunchError> {
        let selection = TestSelection::from_parts(&request.class_name, &request.gherkin_url)?;
        let obrs = parse_obrs(&request.obr);

        let workspace = tempfile::Builder::new().prefix("testrun-").tempdir()?;
        let overrides = effective_overrides(&self.config.home, &request.overrides);
        let overrides_file = write_overrides_file(workspace.path(), &overrides)?;

        let command = build_command(&self.config, &obrs, &selection, &overrides_file, request.trace)?;

        let template = TestRunSnapshot {
            bundle_name: selection.bundle().to_string(),
            test_name: selection.test_name().to_string(),
            group: request.group.clone(),
            stream: request.stream.clone(),
            requestor: request.requestor.clone(),
            ..Default::default()
        };

        let lifecycle = LocalRunLifecycle::start(
            self.spawner.as_ref(),
            &command,
            self.events.clone(),
            self.sleeper.clone(),
            template,
            Some(workspace),
        )?;
        Ok((lifecycle, selection))
    }
}

/// Waits for the run name and then the result store of a new process.
async fn detect_run(
    lifecycle: &mut LocalRunLifecycle,
    timeout: Option<Duration>,
) -> Result<String, LaunchError> {
    let run_id = lifecycle
        .wait_for_run_id(timeout)
        .await?
        .ok_or(LaunchError::RunIdNotDetected)?;

    if lifecycle.wait_for_ras_location(timeout).await?.is_none() {
        return Err(LaunchError::RasLocationNotDetected { run_id });
    }
    Ok(run_id)
}

#[async_trait]
impl Launcher for LocalLauncher {
    async fn submit_test_run(&self, request: &SubmitRequest) -> Result<TestRuns, LaunchError> {
        let (mut lifecycle, selection) = self.prepare(request)?;

        let run_id = match detect_run(&mut lifecycle, self.config.detection_timeout).await {
            Ok(run_id) => run_id,
            Err(err) => {
                warn!(error = %err, test = %selection.test_name(), "Abandoning local test process");
                debug!("Output before abandoning:\n{}", lifecycle.output_tail());
                lifecycle.terminate().await;
                return Err(err);
            }
        };

        info!(
            run_id = %run_id,
            group = %request.group,
            test = %selection.test_name(),
            "Local test process started"
        );

        let snapshot = lifecycle.snapshot().clone();
        self.runs().insert(run_id, lifecycle);

        Ok(TestRuns {
            complete: false,
            runs: vec![snapshot],
        })
    }

    async fn get_runs_by_group(&self, group: &str) -> Result<TestRuns, LaunchError> {
        let mut runs = self.runs();
        let mut snapshots = Vec::new();
        let mut complete = true;

        for lifecycle in runs.values_mut().filter(|l| l.group() == group) {
            if !lifecycle.is_completed() {
                complete = false;
            }
            snapshots.push(lifecycle.snapshot().clone());
        }

        Ok(TestRuns {
            complete,
            runs: snapshots,
        })
    }

    async fn get_run_by_id(&self, run_id: &str) -> Result<DetailedRun, LaunchError> {
        let ras_location = {
            let runs = self.runs();
            let lifecycle = runs
                .get(run_id)
                .ok_or_else(|| LaunchError::UnknownRun(run_id.to_string()))?;
            lifecycle.ras_location()
        };
        let Some(ras_location) = ras_location else {
            warn!(run_id, "No result archive store known for run");
            return Err(LaunchError::RasLocationNotDetected {
                run_id: run_id.to_string(),
            });
        };

        let test_structure = read_structure_file(&ras_location, run_id)?;
        Ok(DetailedRun {
            run_id: run_id.to_string(),
            test_structure,
        })
    }
}
