//! Reconciling the scheduler's view of its runs with the backend's.

use tracing::{info, warn};

use super::record::{MethodResult, RunSets};
use crate::launcher::{Launcher, TestRuns};

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub finished: Vec<String>,
    pub lost: Vec<String>,
    pub status_changed: Vec<String>,
    /// The group status could not be fetched, so nothing changed.
    pub skipped: bool,
}

/// Moves runs out of `submitted` based on a fresh group snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusReconciler {
    fetch_method_details: bool,
}

impl StatusReconciler {
    /// `fetch_method_details` asks for method-level results of each
    /// finished run, which only detailed reports need.
    pub fn new(fetch_method_details: bool) -> Self {
        Self {
            fetch_method_details,
        }
    }

    /// Fetches the group's status and applies it. A failed fetch skips the
    /// pass; it is retried on the next poll.
    pub async fn reconcile(
        &self,
        launcher: &dyn Launcher,
        group: &str,
        sets: &mut RunSets,
    ) -> ReconcileSummary {
        let current = match launcher.get_runs_by_group(group).await {
            Ok(runs) => runs,
            Err(err) => {
                warn!(group, "Failed to fetch the group's status, will retry: {}", err);
                return ReconcileSummary {
                    skipped: true,
                    ..Default::default()
                };
            }
        };

        let summary = apply_snapshot(sets, &current);

        if self.fetch_method_details {
            for name in &summary.finished {
                fetch_method_results(launcher, sets, name).await;
            }
        }

        summary
    }
}

/// Applies one snapshot to the run sets.
///
/// Every submitted run must appear in the snapshot. Those reporting the
/// terminal status move to `finished`; those missing move to `lost`.
pub fn apply_snapshot(sets: &mut RunSets, current: &TestRuns) -> ReconcileSummary {
    let mut summary = ReconcileSummary::default();
    let mut unseen = sets.submitted.clone();

    for snapshot in &current.runs {
        let name = snapshot.name.as_str();
        if unseen.remove(name).is_none() {
            continue;
        }

        if let Some(record) = sets.submitted.get_mut(name) {
            if record.run_id.is_empty() {
                if let Some(run_id) = &snapshot.run_id {
                    record.run_id = run_id.clone();
                }
            }
        }

        if snapshot.is_finished() {
            if let Some(record) = sets.mark_finished(name, snapshot.result.as_deref()) {
                info!(
                    run = name,
                    result = %record.result,
                    "Run {} has finished - {}",
                    name,
                    record.describe()
                );
                summary.finished.push(name.to_string());
            }
        } else if let Some(record) = sets.submitted.get_mut(name) {
            if record.status != snapshot.status {
                record.status = snapshot.status.clone();
                info!(
                    run = name,
                    status = %record.status,
                    "Run {} status is now '{}' - {}",
                    name,
                    record.status,
                    record.describe()
                );
                summary.status_changed.push(name.to_string());
            }
        }
    }

    for name in unseen.keys() {
        if let Some(record) = sets.mark_lost(name) {
            warn!(run = %name, "Run {} was lost - {}", name, record.describe());
            summary.lost.push(name.clone());
        }
    }

    summary
}

async fn fetch_method_results(launcher: &dyn Launcher, sets: &mut RunSets, name: &str) {
    let Some(detail_id) = sets.finished.get(name).map(|r| {
        if r.run_id.is_empty() {
            r.name.clone()
        } else {
            r.run_id.clone()
        }
    }) else {
        return;
    };

    match launcher.get_run_by_id(&detail_id).await {
        Ok(detail) => {
            if let Some(record) = sets.finished.get_mut(name) {
                record.tests = detail
                    .test_structure
                    .methods
                    .iter()
                    .map(MethodResult::from)
                    .collect();
            }
        }
        Err(err) => warn!(run = name, "Failed to fetch method results: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::LaunchError;
    use crate::launcher::{
        DetailedRun, SubmitRequest, TestMethod, TestRunSnapshot, TestStructure, RESULT_UNKNOWN,
    };
    use crate::runs::record::RunRecord;

    fn submitted(names: &[&str]) -> RunSets {
        let mut sets = RunSets::default();
        for name in names {
            sets.mark_submitted(RunRecord {
                name: name.to_string(),
                status: "queued".to_string(),
                ..Default::default()
            });
        }
        sets
    }

    fn snapshot(name: &str, status: &str, result: Option<&str>) -> TestRunSnapshot {
        TestRunSnapshot {
            name: name.to_string(),
            status: status.to_string(),
            result: result.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_runs_become_lost() {
        let mut sets = submitted(&["U1", "U2"]);
        let current = TestRuns {
            complete: false,
            runs: vec![snapshot("U1", "running", None)],
        };

        let summary = apply_snapshot(&mut sets, &current);

        assert_eq!(summary.lost, vec!["U2".to_string()]);
        assert!(sets.lost.contains_key("U2"));
        assert!(sets.submitted.contains_key("U1"));
        assert!(!sets.submitted.contains_key("U2"));
    }

    #[test]
    fn test_finished_runs_move_once_with_result() {
        let mut sets = submitted(&["U1", "U2"]);
        let current = TestRuns {
            complete: false,
            runs: vec![
                snapshot("U1", "finished", Some("Passed")),
                snapshot("U2", "finished", None),
            ],
        };

        let summary = apply_snapshot(&mut sets, &current);
        assert_eq!(summary.finished.len(), 2);
        assert_eq!(sets.finished["U1"].result, "Passed");
        assert_eq!(sets.finished["U2"].result, RESULT_UNKNOWN);

        // A second identical snapshot changes nothing.
        let again = apply_snapshot(&mut sets, &current);
        assert!(again.finished.is_empty());
        assert!(again.lost.is_empty());
        assert_eq!(sets.finished.len(), 2);
    }

    #[test]
    fn test_status_change_updates_in_place() {
        let mut sets = submitted(&["U1"]);
        let mut with_id = snapshot("U1", "building", None);
        with_id.run_id = Some("cdb-1".to_string());
        let current = TestRuns {
            complete: false,
            runs: vec![with_id],
        };

        let summary = apply_snapshot(&mut sets, &current);

        assert_eq!(summary.status_changed, vec!["U1".to_string()]);
        assert_eq!(sets.submitted["U1"].status, "building");
        assert_eq!(sets.submitted["U1"].run_id, "cdb-1");

        let unchanged = apply_snapshot(&mut sets, &current);
        assert!(unchanged.status_changed.is_empty());
    }

    #[test]
    fn test_unrelated_runs_are_ignored() {
        let mut sets = submitted(&["U1"]);
        let current = TestRuns {
            complete: false,
            runs: vec![
                snapshot("U1", "running", None),
                snapshot("X9", "finished", Some("Passed")),
            ],
        };

        let summary = apply_snapshot(&mut sets, &current);

        assert!(summary.finished.is_empty());
        assert!(!sets.finished.contains_key("X9"));
    }

    #[test]
    fn test_sets_stay_disjoint() {
        let mut sets = submitted(&["A", "B", "C", "D"]);
        let current = TestRuns {
            complete: false,
            runs: vec![
                snapshot("A", "finished", Some("Failed")),
                snapshot("B", "running", None),
                snapshot("D", "finished", Some("Passed")),
            ],
        };

        apply_snapshot(&mut sets, &current);

        let mut all: Vec<&String> = sets
            .submitted
            .keys()
            .chain(sets.finished.keys())
            .chain(sets.lost.keys())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
        assert_eq!(total, 4);
    }

    struct StubLauncher {
        group: Result<TestRuns, ()>,
        details: HashMap<String, Vec<TestMethod>>,
        detail_requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Launcher for StubLauncher {
        async fn submit_test_run(&self, _: &SubmitRequest) -> Result<TestRuns, LaunchError> {
            unreachable!("not used by the reconciler")
        }

        async fn get_runs_by_group(&self, _: &str) -> Result<TestRuns, LaunchError> {
            self.group.clone().map_err(|_| LaunchError::Api {
                code: 503,
                message: "unavailable".to_string(),
            })
        }

        async fn get_run_by_id(&self, run_id: &str) -> Result<DetailedRun, LaunchError> {
            self.detail_requests.lock().unwrap().push(run_id.to_string());
            let methods = self
                .details
                .get(run_id)
                .cloned()
                .ok_or_else(|| LaunchError::UnknownRun(run_id.to_string()))?;
            Ok(DetailedRun {
                run_id: run_id.to_string(),
                test_structure: TestStructure {
                    methods,
                    ..Default::default()
                },
            })
        }
    }

    #[tokio::test]
    async fn test_failed_group_fetch_skips_pass() {
        let launcher = StubLauncher {
            group: Err(()),
            details: HashMap::new(),
            detail_requests: Mutex::new(Vec::new()),
        };
        let mut sets = submitted(&["U1"]);

        let summary = StatusReconciler::new(false)
            .reconcile(&launcher, "g1", &mut sets)
            .await;

        assert!(summary.skipped);
        assert!(sets.submitted.contains_key("U1"));
        assert!(sets.lost.is_empty());
    }

    #[tokio::test]
    async fn test_method_details_fetched_only_when_requested() {
        let mut details = HashMap::new();
        details.insert(
            "U1".to_string(),
            vec![TestMethod {
                method_name: "works".to_string(),
                result: "Passed".to_string(),
                ..Default::default()
            }],
        );
        let launcher = StubLauncher {
            group: Ok(TestRuns {
                complete: true,
                runs: vec![snapshot("U1", "finished", Some("Passed"))],
            }),
            details,
            detail_requests: Mutex::new(Vec::new()),
        };

        let mut without = submitted(&["U1"]);
        StatusReconciler::new(false)
            .reconcile(&launcher, "g1", &mut without)
            .await;
        assert!(without.finished["U1"].tests.is_empty());
        assert!(launcher.detail_requests.lock().unwrap().is_empty());

        let mut with = submitted(&["U1"]);
        StatusReconciler::new(true)
            .reconcile(&launcher, "g1", &mut with)
            .await;
        assert_eq!(
            with.finished["U1"].tests,
            vec![MethodResult {
                method: "works".to_string(),
                result: "Passed".to_string()
            }]
        );
    }
}
