//! Wire types shared by every launcher.
//!
//! These mirror the shapes the execution backend reports: a group-wide list
//! of run snapshots, the detailed structure of a single run, and the request
//! used to submit one test class.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The status value a run reports once it can make no further progress.
pub const STATUS_FINISHED: &str = "finished";

/// Result reported when the backend never supplied one.
pub const RESULT_UNKNOWN: &str = "unknown";

/// One test class to be submitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Correlation id shared by all runs of one invocation.
    pub group: String,
    /// `<bundle>/<class>`, or empty for gherkin tests.
    pub class_name: String,
    pub request_type: String,
    pub requestor: String,
    pub stream: String,
    pub obr: String,
    pub trace: bool,
    pub gherkin_url: String,
    pub gherkin_feature: String,
    pub overrides: BTreeMap<String, String>,
}

/// A group-wide view of runs, as returned by submission and status queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRuns {
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub runs: Vec<TestRunSnapshot>,
}

/// The backend's current view of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunSnapshot {
    /// Human-facing run name, e.g. `U123` or `L4`.
    #[serde(default)]
    pub name: String,
    /// Storage id used to fetch detailed results. Falls back to `name` when absent.
    #[serde(
        default,
        rename = "rasRunId",
        alias = "runId",
        skip_serializing_if = "Option::is_none"
    )]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub bundle_name: String,
    #[serde(default)]
    pub test_name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub requestor: String,
    #[serde(default)]
    pub queued: String,
    #[serde(default)]
    pub submission_id: String,
}

impl TestRunSnapshot {
    /// Whether the backend reports this run as terminal.
    pub fn is_finished(&self) -> bool {
        self.status == STATUS_FINISHED
    }

    /// The id to use when asking for detailed results.
    pub fn detail_id(&self) -> &str {
        self.run_id.as_deref().unwrap_or(&self.name)
    }
}

/// A single run with its full on-disk or RAS structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedRun {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub test_structure: TestStructure,
}

/// The `structure.json` record a run writes into its result archive store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStructure {
    #[serde(default)]
    pub run_name: String,
    #[serde(default)]
    pub bundle: String,
    #[serde(default)]
    pub test_name: String,
    #[serde(default)]
    pub test_short_name: String,
    #[serde(default)]
    pub requestor: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub queued: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default)]
    pub methods: Vec<TestMethod>,
}

/// Method-level outcome inside a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMethod {
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub method_name: String,
    #[serde(default, rename = "type")]
    pub method_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}
