//! Run records and the four run sets the scheduler keeps them in.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::launcher::{TestMethod, RESULT_UNKNOWN, STATUS_FINISHED};

/// Status given to records before they are submitted.
pub const STATUS_QUEUED: &str = "queued";

/// One test class, from the ready queue through to a terminal set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Assigned by the launcher on submission. Empty while ready.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bundle: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub obr: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub queued: String,
    #[serde(default)]
    pub requestor: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub tests: Vec<MethodResult>,
    #[serde(default, rename = "gherkin", skip_serializing_if = "String::is_empty")]
    pub gherkin_url: String,
    #[serde(default, rename = "feature", skip_serializing_if = "String::is_empty")]
    pub gherkin_feature: String,
    #[serde(default)]
    pub group: String,
    #[serde(default, rename = "submissionId")]
    pub submission_id: String,
    #[serde(default, rename = "runId", skip_serializing_if = "String::is_empty")]
    pub run_id: String,
}

/// Outcome of one test method, as written to reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodResult {
    #[serde(rename = "name")]
    pub method: String,
    pub result: String,
}

impl From<&TestMethod> for MethodResult {
    fn from(method: &TestMethod) -> Self {
        Self {
            method: method.method_name.clone(),
            result: method.result.clone(),
        }
    }
}

impl RunRecord {
    pub fn is_gherkin(&self) -> bool {
        !self.gherkin_url.is_empty()
    }

    /// `<bundle>/<class>`, or empty for gherkin tests.
    pub fn class_name(&self) -> String {
        if self.is_gherkin() {
            String::new()
        } else {
            format!("{}/{}", self.bundle, self.class)
        }
    }

    /// Short description used in log lines and reports.
    pub fn describe(&self) -> String {
        if self.is_gherkin() {
            format!("{} (gherkin)", self.gherkin_feature)
        } else {
            format!("{}/{}/{}", self.stream, self.bundle, self.class)
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == STATUS_FINISHED
    }

    /// Key used for a record that never got a name.
    fn unsubmitted_key(&self) -> String {
        if self.is_gherkin() {
            self.gherkin_feature.clone()
        } else {
            self.class_name()
        }
    }
}

/// The ready queue plus the three keyed sets. A name lives in at most one
/// keyed set, and once it leaves `submitted` it never returns.
#[derive(Debug, Clone, Default)]
pub struct RunSets {
    pub ready: VecDeque<RunRecord>,
    pub submitted: BTreeMap<String, RunRecord>,
    pub finished: BTreeMap<String, RunRecord>,
    pub lost: BTreeMap<String, RunRecord>,
}

impl RunSets {
    pub fn new(ready: impl IntoIterator<Item = RunRecord>) -> Self {
        Self {
            ready: ready.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Whether anything is still waiting to be submitted or to finish.
    pub fn has_outstanding(&self) -> bool {
        !self.ready.is_empty() || !self.submitted.is_empty()
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.submitted.contains_key(name)
            || self.finished.contains_key(name)
            || self.lost.contains_key(name)
    }

    /// Records a successfully submitted run. A name that was already used is
    /// treated as lost rather than resurrected.
    pub fn mark_submitted(&mut self, record: RunRecord) {
        if record.name.is_empty() {
            warn!(test = %record.describe(), "Launcher returned a run without a name");
            self.lose_unsubmitted(record);
            return;
        }
        if self.is_known(&record.name) {
            warn!(run = %record.name, "Launcher returned a run name already in use");
            self.lose_unsubmitted(record);
            return;
        }
        self.submitted.insert(record.name.clone(), record);
    }

    /// Moves a submitted run to `finished`, defaulting an empty result.
    pub fn mark_finished(&mut self, name: &str, result: Option<&str>) -> Option<&mut RunRecord> {
        let mut record = self.submitted.remove(name)?;
        record.status = STATUS_FINISHED.to_string();
        record.result = match result {
            Some(r) if !r.is_empty() => r.to_string(),
            _ => RESULT_UNKNOWN.to_string(),
        };
        self.finished.insert(name.to_string(), record);
        self.finished.get_mut(name)
    }

    /// Moves a submitted run to `lost`.
    pub fn mark_lost(&mut self, name: &str) -> Option<&RunRecord> {
        let record = self.submitted.remove(name)?;
        self.lost.insert(name.to_string(), record);
        self.lost.get(name)
    }

    /// Puts a record which never made it to `submitted` into `lost`.
    pub fn lose_unsubmitted(&mut self, record: RunRecord) {
        let base = if record.name.is_empty() || self.is_known(&record.name) {
            record.unsubmitted_key()
        } else {
            record.name.clone()
        };
        let mut key = base.clone();
        let mut attempt = 1;
        while self.is_known(&key) {
            attempt += 1;
            key = format!("{}#{}", base, attempt);
        }
        self.lost.insert(key, record);
    }

    /// Everything in `finished` or `lost`, lost runs last.
    pub fn terminal_runs(&self) -> impl Iterator<Item = &RunRecord> {
        self.finished.values().chain(self.lost.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> RunRecord {
        RunRecord {
            name: name.to_string(),
            bundle: "my.bundle".to_string(),
            class: "my.bundle.MyTest".to_string(),
            stream: "main".to_string(),
            status: STATUS_QUEUED.to_string(),
            ..Default::default()
        }
    }

    fn assert_disjoint(sets: &RunSets) {
        for name in sets.submitted.keys() {
            assert!(!sets.finished.contains_key(name));
            assert!(!sets.lost.contains_key(name));
        }
        for name in sets.finished.keys() {
            assert!(!sets.lost.contains_key(name));
        }
    }

    #[test]
    fn test_finish_defaults_result_to_unknown() {
        let mut sets = RunSets::default();
        sets.mark_submitted(record("U1"));

        let finished = sets.mark_finished("U1", None).unwrap();

        assert_eq!(finished.result, RESULT_UNKNOWN);
        assert!(finished.is_finished());
        assert!(sets.submitted.is_empty());
        assert_disjoint(&sets);
    }

    #[test]
    fn test_finish_keeps_backend_result() {
        let mut sets = RunSets::default();
        sets.mark_submitted(record("U1"));
        sets.mark_finished("U1", Some("Passed"));
        assert_eq!(sets.finished["U1"].result, "Passed");

        assert!(sets.mark_finished("U1", Some("Failed")).is_none());
        assert_eq!(sets.finished["U1"].result, "Passed");
    }

    #[test]
    fn test_reused_name_is_never_resubmitted() {
        let mut sets = RunSets::default();
        sets.mark_submitted(record("U1"));
        sets.mark_lost("U1");

        sets.mark_submitted(record("U1"));

        assert!(sets.submitted.is_empty());
        assert_eq!(sets.lost.len(), 2);
        assert_disjoint(&sets);
    }

    #[test]
    fn test_unsubmitted_records_get_distinct_keys() {
        let mut sets = RunSets::default();
        sets.lose_unsubmitted(record(""));
        sets.lose_unsubmitted(record(""));

        assert!(sets.lost.contains_key("my.bundle/my.bundle.MyTest"));
        assert!(sets.lost.contains_key("my.bundle/my.bundle.MyTest#2"));
    }

    #[test]
    fn test_gherkin_description() {
        let gherkin = RunRecord {
            gherkin_url: "file:///f/login.feature".to_string(),
            gherkin_feature: "login".to_string(),
            ..Default::default()
        };
        assert_eq!(gherkin.class_name(), "");
        assert_eq!(gherkin.describe(), "login (gherkin)");
        assert_eq!(record("x").describe(), "main/my.bundle/my.bundle.MyTest");
    }

    #[test]
    fn test_report_field_names() {
        let mut run = record("U1");
        run.run_id = "cdb-1".to_string();
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["runId"], "cdb-1");
        assert!(value.get("submissionId").is_some());
        assert!(value.get("gherkin").is_none());
    }
}
