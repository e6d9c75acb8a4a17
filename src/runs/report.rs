//! Progress and final reports.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::record::{RunRecord, RunSets};
use super::throttle::ThrottleSnapshot;
use crate::error::ReportError;

pub const RESULT_PASSED: &str = "Passed";
pub const RESULT_PASSED_WITH_DEFECTS: &str = "Passed With Defects";
pub const RESULT_FAILED: &str = "Failed";
pub const RESULT_FAILED_WITH_DEFECTS: &str = "Failed With Defects";
pub const RESULT_LOST: &str = "Lost";
pub const RESULT_ENVFAIL: &str = "EnvFail";

const STANDARD_RESULTS: [&str; 6] = [
    RESULT_PASSED,
    RESULT_PASSED_WITH_DEFECTS,
    RESULT_FAILED,
    RESULT_FAILED_WITH_DEFECTS,
    RESULT_LOST,
    RESULT_ENVFAIL,
];

/// Lost runs plus finished runs whose result does not start with `Passed`.
pub fn count_failed(sets: &RunSets) -> usize {
    sets.lost.len()
        + sets
            .finished
            .values()
            .filter(|r| !r.result.starts_with(RESULT_PASSED))
            .count()
}

/// Result label counts over finished and lost runs.
pub fn result_counts(sets: &RunSets) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for run in sets.finished.values() {
        *counts.entry(run.result.clone()).or_default() += 1;
    }
    counts.insert(RESULT_LOST.to_string(), sets.lost.len());
    counts
}

/// Standard labels first in a fixed order, then any others alphabetically.
pub fn ordered_result_labels(counts: &BTreeMap<String, usize>) -> Vec<String> {
    let mut labels: Vec<String> = STANDARD_RESULTS.iter().map(|s| s.to_string()).collect();
    labels.extend(
        counts
            .keys()
            .filter(|k| !STANDARD_RESULTS.contains(&k.as_str()))
            .cloned(),
    );
    labels
}

fn results_line(sets: &RunSets) -> String {
    let counts = result_counts(sets);
    let total = sets.finished.len() + sets.lost.len();
    let mut line = format!("*** Total={}", total);
    for label in ordered_result_labels(&counts) {
        let _ = write!(line, ", {}={}", label, counts.get(&label).copied().unwrap_or(0));
    }
    line
}

/// The periodic report logged while runs are in flight.
pub fn interim_report(sets: &RunSets, throttle: &ThrottleSnapshot) -> String {
    let mut out = String::new();
    out.push_str("***\n*** Progress report\n*** ---------------\n");
    for (name, run) in &sets.submitted {
        let _ = writeln!(out, "***     Run {} is currently {} - {}", name, run.status, run.describe());
    }
    out.push_str(
        "*** ----------------------------------------------------------------------------\n",
    );
    let _ = writeln!(
        out,
        "*** run status, ready={}, submitted={}, finished={}, lost={}",
        sets.ready.len(),
        sets.submitted.len(),
        sets.finished.len(),
        sets.lost.len()
    );
    let _ = writeln!(out, "*** throttle={}", throttle);
    if !sets.finished.is_empty() || !sets.lost.is_empty() {
        out.push_str("*** Results so far:\n");
        out.push_str(&results_line(sets));
        out.push('\n');
    }
    out.push_str("***\n");
    out
}

fn section<'a, F>(out: &mut String, title: &str, runs: impl Iterator<Item = (&'a String, &'a RunRecord)>, show_result: bool, keep: F)
where
    F: Fn(&RunRecord) -> bool,
{
    let _ = writeln!(out, "*** {} test runs:-", title);
    let mut found = false;
    for (name, run) in runs.filter(|(_, r)| keep(r)) {
        if show_result {
            let _ = writeln!(out, "***     Run {}({}) - {}", name, run.result, run.describe());
        } else {
            let _ = writeln!(out, "***     Run {} - {}", name, run.describe());
        }
        found = true;
    }
    if !found {
        out.push_str("***     None\n");
    }
    out.push_str("***\n");
}

/// The human-readable summary printed once every run is terminal.
pub fn final_report(sets: &RunSets) -> String {
    let mut out = String::new();
    out.push_str("***\n*** Final report\n*** ---------------\n***\n");

    let is_passed = |r: &RunRecord| {
        r.result.starts_with(RESULT_PASSED) && !r.result.starts_with(RESULT_PASSED_WITH_DEFECTS)
    };
    let is_failed = |r: &RunRecord| {
        r.result.starts_with(RESULT_FAILED) && !r.result.starts_with(RESULT_FAILED_WITH_DEFECTS)
    };

    section(&mut out, "Passed", sets.finished.iter(), false, is_passed);
    section(&mut out, "Failed", sets.finished.iter(), false, is_failed);
    section(&mut out, "Passed With Defects", sets.finished.iter(), false, |r| {
        r.result.starts_with(RESULT_PASSED_WITH_DEFECTS)
    });
    section(&mut out, "Failed With Defects", sets.finished.iter(), false, |r| {
        r.result.starts_with(RESULT_FAILED_WITH_DEFECTS)
    });
    section(&mut out, "Other", sets.finished.iter(), true, |r| {
        !r.result.starts_with(RESULT_PASSED) && !r.result.starts_with(RESULT_FAILED)
    });
    section(&mut out, "Lost", sets.lost.iter(), false, |_| true);

    out.push_str("*** Results\n");
    out.push_str(&results_line(sets));
    out.push('\n');
    out
}

/// Shape of the JSON and YAML report files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub tests: Vec<RunRecord>,
}

impl TestReport {
    pub fn from_sets(sets: &RunSets) -> Self {
        Self {
            tests: sets.terminal_runs().cloned().collect(),
        }
    }
}

fn write_report(path: &Path, body: String, kind: &str) -> Result<(), ReportError> {
    std::fs::write(path, body).map_err(|e| ReportError::Write {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    info!(path = %path.display(), "{} test report written", kind);
    Ok(())
}

pub fn write_json_report(path: &Path, sets: &RunSets) -> Result<(), ReportError> {
    let body = serde_json::to_string_pretty(&TestReport::from_sets(sets)).map_err(|e| {
        ReportError::Serialize {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    })?;
    write_report(path, body, "JSON")
}

pub fn write_yaml_report(path: &Path, sets: &RunSets) -> Result<(), ReportError> {
    let body = serde_yaml::to_string(&TestReport::from_sets(sets)).map_err(|e| {
        ReportError::Serialize {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    })?;
    write_report(path, body, "YAML")
}
