//! Portfolios: YAML lists of the test classes to run.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::record::{RunRecord, STATUS_QUEUED};
use crate::error::{LaunchError, PortfolioError};
use crate::launcher::local::command::{gherkin_feature_name, split_class_name};

pub const PORTFOLIO_API_VERSION: &str = "v1alpha";
pub const PORTFOLIO_KIND: &str = "galasa.dev/testPortfolio";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: PortfolioMetadata,
    #[serde(default)]
    pub classes: Vec<PortfolioClass>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetadata {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioClass {
    #[serde(default)]
    pub bundle: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub obr: String,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    #[serde(default, rename = "gherkin", skip_serializing_if = "String::is_empty")]
    pub gherkin_url: String,
}

impl Default for Portfolio {
    fn default() -> Self {
        Self::new()
    }
}

impl Portfolio {
    pub fn new() -> Self {
        Self {
            api_version: PORTFOLIO_API_VERSION.to_string(),
            kind: PORTFOLIO_KIND.to_string(),
            metadata: PortfolioMetadata::default(),
            classes: Vec::new(),
        }
    }

    /// Adds a `<bundle>/<class>` selection. Duplicates are skipped.
    pub fn add_class(&mut self, class_name: &str, stream: &str, obr: &str) -> Result<(), LaunchError> {
        let (bundle, class) = split_class_name(class_name)?;
        let exists = self
            .classes
            .iter()
            .any(|c| c.bundle == bundle && c.class == class && c.stream == stream);
        if !exists {
            self.classes.push(PortfolioClass {
                bundle,
                class,
                stream: stream.to_string(),
                obr: obr.to_string(),
                ..Default::default()
            });
        }
        Ok(())
    }

    /// Adds a gherkin feature selection. Duplicates are skipped.
    pub fn add_gherkin(&mut self, url: &str) -> Result<(), LaunchError> {
        gherkin_feature_name(url)?;
        if !self.classes.iter().any(|c| c.gherkin_url == url) {
            self.classes.push(PortfolioClass {
                gherkin_url: url.to_string(),
                ..Default::default()
            });
        }
        Ok(())
    }

    /// Builds the ready queue. Per-class overrides win over `run_overrides`.
    pub fn ready_runs(
        &self,
        run_overrides: &BTreeMap<String, String>,
        requestor: &str,
        queued: &str,
    ) -> Vec<RunRecord> {
        self.classes
            .iter()
            .map(|entry| {
                let mut overrides = run_overrides.clone();
                overrides.extend(entry.overrides.clone());

                let gherkin_feature = if entry.gherkin_url.is_empty() {
                    String::new()
                } else {
                    gherkin_feature_name(&entry.gherkin_url).unwrap_or_default()
                };

                let record = RunRecord {
                    bundle: entry.bundle.clone(),
                    class: entry.class.clone(),
                    stream: entry.stream.clone(),
                    obr: entry.obr.clone(),
                    status: STATUS_QUEUED.to_string(),
                    queued: queued.to_string(),
                    requestor: requestor.to_string(),
                    overrides,
                    gherkin_url: entry.gherkin_url.clone(),
                    gherkin_feature,
                    ..Default::default()
                };
                debug!(test = %record.describe(), "Added test to the ready queue");
                record
            })
            .collect()
    }
}

/// Reads and validates a portfolio file.
pub fn read_portfolio(path: &Path) -> Result<Portfolio, PortfolioError> {
    let display = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|e| PortfolioError::Open {
        path: display.clone(),
        reason: e.to_string(),
    })?;
    let portfolio: Portfolio =
        serde_yaml::from_str(&content).map_err(|e| PortfolioError::BadFormat {
            path: display.clone(),
            reason: e.to_string(),
        })?;

    if portfolio.api_version != PORTFOLIO_API_VERSION {
        return Err(PortfolioError::BadVersion {
            path: display,
            expected: PORTFOLIO_API_VERSION,
        });
    }
    if portfolio.kind != PORTFOLIO_KIND {
        return Err(PortfolioError::BadKind {
            path: display,
            expected: PORTFOLIO_KIND,
        });
    }
    Ok(portfolio)
}

pub fn write_portfolio(path: &Path, portfolio: &Portfolio) -> Result<(), PortfolioError> {
    let write_error = |reason: String| PortfolioError::Write {
        path: path.display().to_string(),
        reason,
    };
    let body = serde_yaml::to_string(portfolio).map_err(|e| write_error(e.to_string()))?;
    std::fs::write(path, body).map_err(|e| write_error(e.to_string()))?;
    info!(path = %path.display(), classes = portfolio.classes.len(), "Portfolio written");
    Ok(())
}

/// Rejects a portfolio with nothing in it.
pub fn ensure_not_empty(portfolio: &Portfolio, source: &str) -> Result<(), PortfolioError> {
    if portfolio.classes.is_empty() {
        return Err(PortfolioError::Empty {
            path: source.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("portfolio.yaml");
        let mut portfolio = Portfolio::new();
        portfolio
            .add_class("my.bundle/my.bundle.MyTest", "main", "mvn:a/b/1/obr")
            .unwrap();
        portfolio.add_gherkin("file:///f/login.feature").unwrap();

        write_portfolio(&path, &portfolio).unwrap();
        let read = read_portfolio(&path).unwrap();

        assert_eq!(read, portfolio);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("apiVersion: v1alpha"));
        assert!(text.contains("gherkin: file:///f/login.feature"));
    }

    #[test]
    fn test_duplicates_are_skipped() {
        let mut portfolio = Portfolio::new();
        portfolio.add_class("a/a.B", "s", "").unwrap();
        portfolio.add_class("a/a.B", "s", "").unwrap();
        portfolio.add_class("a/a.B", "other", "").unwrap();
        assert_eq!(portfolio.classes.len(), 2);
    }

    #[test]
    fn test_invalid_selection_is_rejected() {
        let mut portfolio = Portfolio::new();
        assert!(portfolio.add_class("noslash", "s", "").is_err());
        assert!(portfolio.add_gherkin("http://x/y.feature").is_err());
    }

    #[test]
    fn test_wrong_version_and_kind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.yaml");

        std::fs::write(&path, "apiVersion: v2\nkind: galasa.dev/testPortfolio\n").unwrap();
        assert!(matches!(read_portfolio(&path), Err(PortfolioError::BadVersion { .. })));

        std::fs::write(&path, "apiVersion: v1alpha\nkind: something\n").unwrap();
        assert!(matches!(read_portfolio(&path), Err(PortfolioError::BadKind { .. })));

        std::fs::write(&path, "classes: [[[").unwrap();
        assert!(matches!(read_portfolio(&path), Err(PortfolioError::BadFormat { .. })));

        assert!(matches!(
            read_portfolio(&dir.path().join("missing.yaml")),
            Err(PortfolioError::Open { .. })
        ));
    }

    #[test]
    fn test_ready_runs_merge_overrides() {
        let mut portfolio = Portfolio::new();
        portfolio.add_class("a/a.B", "s", "mvn:x/y/1/obr").unwrap();
        portfolio.classes[0]
            .overrides
            .insert("shared".to_string(), "from-portfolio".to_string());
        portfolio.add_gherkin("file:///f/login.feature").unwrap();

        let mut run_overrides = BTreeMap::new();
        run_overrides.insert("shared".to_string(), "from-command".to_string());
        run_overrides.insert("only".to_string(), "command".to_string());

        let ready = portfolio.ready_runs(&run_overrides, "tester", "2024-01-01T00:00:00Z");

        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].overrides["shared"], "from-portfolio");
        assert_eq!(ready[0].overrides["only"], "command");
        assert_eq!(ready[0].status, STATUS_QUEUED);
        assert_eq!(ready[0].requestor, "tester");
        assert_eq!(ready[1].gherkin_feature, "login");
        assert_eq!(ready[1].overrides["shared"], "from-command");
    }

    #[test]
    fn test_empty_portfolio_rejected() {
        assert!(matches!(
            ensure_not_empty(&Portfolio::new(), "p.yaml"),
            Err(PortfolioError::Empty { .. })
        ));
    }
}
