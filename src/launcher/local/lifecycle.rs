//! Supervision of one local test process from spawn to exit.
//!
//! A lifecycle owns the scanner attached to the child's output, the alert
//! receiver, and the single-use completion signal sent by a background task
//! once the child exits. The submitting task blocks in [`wait_for_run_id`]
//! and [`wait_for_ras_location`]; after that the poller only ever calls
//! [`is_completed`], which never waits.
//!
//! [`wait_for_run_id`]: LocalRunLifecycle::wait_for_run_id
//! [`wait_for_ras_location`]: LocalRunLifecycle::wait_for_ras_location
//! [`is_completed`]: LocalRunLifecycle::is_completed

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::process::{LaunchCommand, ProcessSpawner, RunningProcess};
use super::scanner::{Detected, OutputStreamScanner, ProcessEvent, ProcessEventSource};
use crate::clock::TimedSleeper;
use crate::error::LaunchError;
use crate::launcher::types::{TestRunSnapshot, TestStructure, RESULT_UNKNOWN, STATUS_FINISHED};

/// Status shown for a local run until its results file can be read.
pub const STATUS_PREPARING: &str = "preparing";

/// Sent once by the background task when the child exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    pub exit_code: Option<i32>,
}

enum Wake {
    Alert,
    Done(Option<CompletionReport>),
    Expired,
}

/// One locally running test.
pub struct LocalRunLifecycle {
    scanner: Arc<OutputStreamScanner>,
    alerts: mpsc::Receiver<ProcessEvent>,
    completion: oneshot::Receiver<CompletionReport>,
    // Dropping this also stops the process.
    kill_switch: Option<oneshot::Sender<()>>,
    completed: bool,
    exit_code: Option<i32>,
    snapshot: TestRunSnapshot,
    // Holds the overrides file until the run is forgotten.
    _workspace: Option<TempDir>,
}

impl LocalRunLifecycle {
    /// Spawns the process and the background task that waits for it to exit.
    ///
    /// `template` supplies the descriptive fields of the run's snapshot; its
    /// name and status are filled in as the run progresses.
    pub fn start(
        spawner: &dyn ProcessSpawner,
        command: &LaunchCommand,
        events: Arc<dyn ProcessEventSource>,
        sleeper: Arc<dyn TimedSleeper>,
        template: TestRunSnapshot,
        workspace: Option<TempDir>,
    ) -> Result<Self, LaunchError> {
        let (scanner, alerts) = OutputStreamScanner::new(events);
        let scanner = Arc::new(scanner);

        info!(command = %command.display(), "Launching local test process");
        let process = spawner.spawn(command, scanner.clone())?;

        let (done, completion) = oneshot::channel();
        let (kill_switch, kill) = oneshot::channel();
        tokio::spawn(watch_process(process, kill, done, sleeper));

        Ok(Self {
            scanner,
            alerts,
            completion,
            kill_switch: Some(kill_switch),
            completed: false,
            exit_code: None,
            snapshot: TestRunSnapshot {
                status: STATUS_PREPARING.to_string(),
                result: Some(RESULT_UNKNOWN.to_string()),
                ..template
            },
            _workspace: workspace,
        })
    }

    /// Waits until the process traces its run name. Returns `None` if the
    /// process exits first.
    pub async fn wait_for_run_id(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, LaunchError> {
        let run_id = self
            .wait_for("an allocated run name", |d| d.run_id.clone(), timeout)
            .await?;
        if let Some(id) = &run_id {
            self.snapshot.name = id.clone();
            self.snapshot.run_id = Some(id.clone());
        }
        Ok(run_id)
    }

    /// Waits until the process traces where it stores results. Returns
    /// `None` if the process exits first.
    pub async fn wait_for_ras_location(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, LaunchError> {
        self.wait_for(
            "the result archive store location",
            |d| d.ras_location.clone(),
            timeout,
        )
        .await
    }

    async fn wait_for<F>(
        &mut self,
        what: &'static str,
        pick: F,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, LaunchError>
    where
        F: Fn(&Detected) -> Option<String>,
    {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if let Some(found) = pick(&self.scanner.detected()) {
                return Ok(Some(found));
            }
            if self.completed {
                return Ok(None);
            }

            let expiry = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let wake = tokio::select! {
                _ = self.alerts.recv() => Wake::Alert,
                report = &mut self.completion => Wake::Done(report.ok()),
                _ = expiry => Wake::Expired,
            };

            match wake {
                Wake::Alert => {}
                Wake::Done(report) => self.record_completion(report),
                Wake::Expired => {
                    return Err(LaunchError::DetectionTimeout {
                        what,
                        waited: timeout.unwrap_or_default(),
                    })
                }
            }
        }
    }

    /// Kills the process if it is still running and waits for it to be reaped.
    pub async fn terminate(&mut self) {
        if self.completed {
            return;
        }
        if let Some(kill) = self.kill_switch.take() {
            let _ = kill.send(());
        }
        let report = (&mut self.completion).await.ok();
        self.completed = true;
        self.exit_code = report.and_then(|r| r.exit_code);
        self.promote_placeholder();
    }

    /// Whether the process has exited. Never waits.
    pub fn is_completed(&mut self) -> bool {
        if self.completed {
            return true;
        }
        match self.completion.try_recv() {
            Ok(report) => {
                self.record_completion(Some(report));
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.record_completion(None);
                true
            }
        }
    }

    fn record_completion(&mut self, report: Option<CompletionReport>) {
        self.completed = true;
        self.exit_code = report.and_then(|r| r.exit_code);

        let Some(run_id) = self.run_id() else {
            self.promote_placeholder();
            return;
        };
        let Some(ras_location) = self.ras_location() else {
            warn!(run_id = %run_id, "Run finished without tracing its result archive store");
            self.promote_placeholder();
            return;
        };

        match read_structure_file(&ras_location, &run_id) {
            Ok(structure) => {
                info!(
                    run_id = %run_id,
                    status = %structure.status,
                    result = structure.result.as_deref().unwrap_or(RESULT_UNKNOWN),
                    "Local run finished"
                );
                self.apply_structure(structure);
            }
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "Could not read the results of a finished local run");
                self.promote_placeholder();
            }
        }
    }

    // The process is gone, so the run cannot progress any further.
    fn promote_placeholder(&mut self) {
        self.snapshot.status = STATUS_FINISHED.to_string();
        if self.snapshot.result.is_none() {
            self.snapshot.result = Some(RESULT_UNKNOWN.to_string());
        }
    }

    fn apply_structure(&mut self, structure: TestStructure) {
        let snapshot = &mut self.snapshot;
        if !structure.run_name.is_empty() {
            snapshot.name = structure.run_name;
        }
        if !structure.bundle.is_empty() {
            snapshot.bundle_name = structure.bundle;
        }
        if !structure.test_name.is_empty() {
            snapshot.test_name = structure.test_name;
        }
        if !structure.requestor.is_empty() {
            snapshot.requestor = structure.requestor;
        }
        if !structure.queued.is_empty() {
            snapshot.queued = structure.queued;
        }
        snapshot.status = if structure.status.is_empty() {
            STATUS_FINISHED.to_string()
        } else {
            structure.status
        };
        snapshot.result = Some(
            structure
                .result
                .unwrap_or_else(|| RESULT_UNKNOWN.to_string()),
        );
        // A process that has exited can never move the run on.
        if !snapshot.is_finished() {
            debug!(status = %snapshot.status, "Treating exited local run as finished");
            snapshot.status = STATUS_FINISHED.to_string();
        }
    }

    pub fn run_id(&self) -> Option<String> {
        self.scanner.run_id()
    }

    pub fn ras_location(&self) -> Option<String> {
        self.scanner.ras_location()
    }

    /// Recent output of the process, for diagnosing a failed start.
    pub fn output_tail(&self) -> String {
        self.scanner.output_tail()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// The latest view of the run.
    pub fn snapshot(&self) -> &TestRunSnapshot {
        &self.snapshot
    }

    pub fn group(&self) -> &str {
        &self.snapshot.group
    }
}

/// Background task: blocks on process exit, then signals completion once.
/// A kill request, or the lifecycle going away, stops the process first.
async fn watch_process(
    mut process: Box<dyn RunningProcess>,
    mut kill: oneshot::Receiver<()>,
    done: oneshot::Sender<CompletionReport>,
    sleeper: Arc<dyn TimedSleeper>,
) {
    let exited = tokio::select! {
        exit = process.wait() => Some(exit),
        _ = &mut kill => None,
    };
    let exit = match exited {
        Some(exit) => exit,
        None => {
            info!("Stopping local test process");
            if let Err(err) = process.kill().await {
                warn!(error = %err, "Failed to kill the test process");
            }
            process.wait().await
        }
    };

    let exit_code = match exit {
        Ok(code) => code,
        Err(err) => {
            warn!(error = %err, "Failed waiting for the test process");
            None
        }
    };
    debug!(?exit_code, "Test process exited");

    let _ = done.send(CompletionReport { exit_code });
    sleeper.interrupt("local test process exited");
}

/// Filesystem path of a `file://` result archive store.
pub fn ras_folder(ras_location: &str) -> PathBuf {
    PathBuf::from(ras_location.strip_prefix("file://").unwrap_or(ras_location))
}

/// Reads `<ras>/<run_id>/structure.json`.
pub fn read_structure_file(ras_location: &str, run_id: &str) -> Result<TestStructure, LaunchError> {
    let path = ras_folder(ras_location).join(run_id).join("structure.json");
    let display = path.display().to_string();

    let content =
        std::fs::read_to_string(&path).map_err(|e| LaunchError::ResultsFileUnreadable {
            path: display.clone(),
            reason: e.to_string(),
        })?;
    if content.trim().is_empty() {
        return Err(LaunchError::ResultsFileEmpty { path: display });
    }
    Ok(serde_json::from_str(&content)?)
}
