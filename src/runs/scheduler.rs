//! The submission control loop.
//!
//! One task drives every run to a terminal set:
//!
//! 1. Submit from the ready queue while fewer than `throttle` runs are in flight.
//! 2. Log an interim progress report when one is due.
//! 3. Refresh the throttle from its file.
//! 4. Reconcile `submitted` against the backend's view of the group.
//! 5. Sleep for the poll interval if runs are still in flight.
//!
//! The loop ends when nothing is ready or submitted. Without a `max_wait`
//! it has no other exit, so a backend that never finishes a run keeps it
//! polling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::record::{RunRecord, RunSets};
use super::reconcile::StatusReconciler;
use super::report::interim_report;
use super::throttle::{ThrottleController, ThrottleSnapshot};
use crate::clock::{TimeService, TimedSleeper};
use crate::error::ThrottleError;
use crate::launcher::{Launcher, SubmitRequest};

pub const DEFAULT_THROTTLE: i64 = 3;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Settings for one batch.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Group every run is submitted under.
    pub group: String,
    /// Maximum runs in flight. Zero or less means no limit.
    pub throttle: i64,
    /// Optional file an operator can edit to change the throttle.
    pub throttle_file: Option<PathBuf>,
    /// Pause between poll cycles. Zero spins without sleeping.
    pub poll_interval: Duration,
    /// Time between interim reports. Zero disables them.
    pub progress_interval: Duration,
    /// Give up on outstanding runs after this long. `None` never gives up.
    pub max_wait: Option<Duration>,
    /// Fetch method-level results of finished runs.
    pub fetch_method_details: bool,
    pub trace: bool,
    pub request_type: String,
    pub requestor: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            group: String::new(),
            throttle: DEFAULT_THROTTLE,
            throttle_file: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            max_wait: None,
            fetch_method_details: false,
            trace: false,
            request_type: "CLI".to_string(),
            requestor: "cli".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..Default::default()
        }
    }

    pub fn with_throttle(mut self, throttle: i64) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_throttle_file(mut self, path: Option<PathBuf>) -> Self {
        self.throttle_file = path;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_method_details(mut self, fetch: bool) -> Self {
        self.fetch_method_details = fetch;
        self
    }
}

/// Where every run ended up.
#[derive(Debug, Clone, Default)]
pub struct SubmissionOutcome {
    /// Only `finished` and `lost` are populated.
    pub runs: RunSets,
    /// The batch was cut short by `max_wait`.
    pub timed_out: bool,
}

fn after(time: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| time.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Drives a batch of runs through a [`Launcher`].
pub struct RunSubmissionScheduler {
    launcher: Arc<dyn Launcher>,
    throttle: ThrottleController,
    reconciler: StatusReconciler,
    time: Arc<dyn TimeService>,
    sleeper: Arc<dyn TimedSleeper>,
    config: SchedulerConfig,
}

impl RunSubmissionScheduler {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        time: Arc<dyn TimeService>,
        sleeper: Arc<dyn TimedSleeper>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            launcher,
            throttle: ThrottleController::new(config.throttle_file.clone()),
            reconciler: StatusReconciler::new(config.fetch_method_details),
            time,
            sleeper,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Runs the batch to completion. Only a failure to write the initial
    /// throttle file aborts it; every per-run failure ends in `lost`.
    pub async fn run(&self, ready: Vec<RunRecord>) -> Result<SubmissionOutcome, ThrottleError> {
        self.throttle.write(self.config.throttle)?;

        let mut sets = RunSets::new(ready);
        let mut throttle = ThrottleSnapshot::new(self.config.throttle);
        let started = self.time.now();
        let deadline = self.config.max_wait.map(|wait| after(started, wait));
        let mut next_progress = after(started, self.config.progress_interval);
        let mut timed_out = false;

        info!(
            group = %self.config.group,
            runs = sets.ready.len(),
            throttle = %throttle,
            "Starting test run submission"
        );

        while sets.has_outstanding() {
            self.submit_ready(&mut sets, &throttle).await;

            if !self.config.progress_interval.is_zero() {
                let now = self.time.now();
                if now >= next_progress {
                    info!("\n{}", interim_report(&sets, &throttle));
                    next_progress = after(now, self.config.progress_interval);
                }
            }

            throttle = self.throttle.refresh(&throttle).snapshot;

            if !sets.submitted.is_empty() {
                self.reconciler
                    .reconcile(self.launcher.as_ref(), &self.config.group, &mut sets)
                    .await;
            }

            if let Some(deadline) = deadline {
                if sets.has_outstanding() && self.time.now() >= deadline {
                    abandon_outstanding(&mut sets);
                    timed_out = true;
                    break;
                }
            }

            if !sets.submitted.is_empty() {
                self.sleeper.sleep(self.config.poll_interval).await;
            }
        }

        info!(
            group = %self.config.group,
            finished = sets.finished.len(),
            lost = sets.lost.len(),
            "All test runs are complete"
        );

        Ok(SubmissionOutcome {
            runs: sets,
            timed_out,
        })
    }

    /// Submits from the head of the ready queue until the throttle is
    /// reached. Returns how many were accepted.
    pub async fn submit_ready(&self, sets: &mut RunSets, throttle: &ThrottleSnapshot) -> usize {
        let mut accepted = 0;
        while throttle.allows(sets.submitted.len()) {
            let Some(record) = sets.ready.pop_front() else {
                break;
            };
            if self.submit_one(record, sets).await {
                accepted += 1;
            }
        }
        accepted
    }

    fn request_for(&self, record: &RunRecord) -> SubmitRequest {
        SubmitRequest {
            group: self.config.group.clone(),
            class_name: record.class_name(),
            request_type: self.config.request_type.clone(),
            requestor: self.config.requestor.clone(),
            stream: record.stream.clone(),
            obr: record.obr.clone(),
            trace: self.config.trace,
            gherkin_url: record.gherkin_url.clone(),
            gherkin_feature: record.gherkin_feature.clone(),
            overrides: record.overrides.clone(),
        }
    }

    async fn submit_one(&self, mut record: RunRecord, sets: &mut RunSets) -> bool {
        record.group = self.config.group.clone();
        let request = self.request_for(&record);

        let submitted = match self.launcher.submit_test_run(&request).await {
            Ok(runs) => runs.runs.into_iter().next(),
            Err(err) => {
                warn!(test = %record.describe(), "Failed to submit test: {}", err);
                sets.lose_unsubmitted(record);
                return false;
            }
        };

        let Some(run) = submitted else {
            warn!(test = %record.describe(), "Lost the run attempting to submit test");
            sets.lose_unsubmitted(record);
            return false;
        };

        record.name = run.name;
        if !run.group.is_empty() {
            record.group = run.group;
        }
        record.submission_id = run.submission_id;
        if let Some(run_id) = run.run_id {
            record.run_id = run_id;
        }
        if !run.status.is_empty() {
            record.status = run.status;
        }

        info!(run = %record.name, "Run {} submitted - {}", record.name, record.describe());
        let name = record.name.clone();
        sets.mark_submitted(record);
        sets.submitted.contains_key(&name)
    }
}

fn abandon_outstanding(sets: &mut RunSets) {
    warn!(
        submitted = sets.submitted.len(),
        ready = sets.ready.len(),
        "Gave up waiting for test runs to finish"
    );
    let names: Vec<String> = sets.submitted.keys().cloned().collect();
    for name in names {
        sets.mark_lost(&name);
    }
    while let Some(record) = sets.ready.pop_front() {
        sets.lose_unsubmitted(record);
    }
}
