//! Error types for testrun-ctl operations.
//!
//! Defines error types for each subsystem:
//! - Launching runs (remote HTTP or local child process)
//! - Throttle file handling
//! - Portfolio and overrides loading
//! - Report writing
//! - The overall submit command

use std::time::Duration;

use thiserror::Error;

/// Errors raised while launching or querying runs.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to start the test process '{command}': {reason}")]
    ProcessStart { command: String, reason: String },

    #[error("The test process ended without tracing an allocated run name")]
    RunIdNotDetected,

    #[error("Run {run_id} never traced the location of its result archive store")]
    RasLocationNotDetected { run_id: String },

    #[error("Gave up waiting {waited:?} for the test process to trace {what}")]
    DetectionTimeout { what: &'static str, waited: Duration },

    #[error("Invalid test class '{0}': expected the form <bundle>/<class>")]
    ClassMissingSlash(String),

    #[error("Invalid test class '{0}': more than one '/' found")]
    ClassTooManySlashes(String),

    #[error("Invalid test class '{0}': the '.class' suffix is not needed")]
    ClassHasSuffix(String),

    #[error("Invalid gherkin URL '{0}': it must start with 'file://' and end with '.feature'")]
    InvalidGherkinUrl(String),

    #[error("Invalid JVM debug mode '{value}' from {origin}: expected 'listen' or 'attach'")]
    InvalidDebugMode { value: String, origin: &'static str },

    #[error("Invalid JVM debug port '{value}' in {property}: expected a whole number")]
    InvalidDebugPort { value: String, property: &'static str },

    #[error("No obr was supplied to locate the test bundles for '{0}'")]
    MissingObr(String),

    #[error("Run '{0}' is not known to this launcher")]
    UnknownRun(String),

    #[error("Results file '{path}' could not be read: {reason}")]
    ResultsFileUnreadable { path: String, reason: String },

    #[error("Results file '{path}' is empty")]
    ResultsFileEmpty { path: String },

    #[error("Invalid trace pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised reading or writing the throttle file.
#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("Failed to read throttle file '{path}': {reason}")]
    Read { path: String, reason: String },

    #[error("Throttle file '{path}' does not contain a whole number: '{content}'")]
    InvalidContent { path: String, content: String },

    #[error("Failed to write throttle file '{path}': {reason}")]
    Write { path: String, reason: String },
}

/// Errors raised loading a portfolio.
#[derive(Debug, Error)]
pub enum PortfolioError {
    #[error("Failed to open portfolio '{path}': {reason}")]
    Open { path: String, reason: String },

    #[error("Portfolio '{path}' is badly formatted: {reason}")]
    BadFormat { path: String, reason: String },

    #[error("Portfolio '{path}' must declare apiVersion '{expected}'")]
    BadVersion { path: String, expected: &'static str },

    #[error("Portfolio '{path}' must declare kind '{expected}'")]
    BadKind { path: String, expected: &'static str },

    #[error("Portfolio '{path}' does not contain any tests")]
    Empty { path: String },

    #[error("Failed to write portfolio '{path}': {reason}")]
    Write { path: String, reason: String },
}

/// Errors raised building the override property map.
#[derive(Debug, Error)]
pub enum OverridesError {
    #[error("Failed to read overrides file '{path}': {reason}")]
    FileUnreadable { path: String, reason: String },

    #[error("Invalid override '{0}': expected the form name=value")]
    Malformed(String),
}

/// Errors raised writing a final report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to serialize the report for '{path}': {reason}")]
    Serialize { path: String, reason: String },

    #[error("Failed to write the report '{path}': {reason}")]
    Write { path: String, reason: String },
}

/// Errors surfaced by the submit command as a whole.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("No tests were selected to run")]
    NoTestsSelected,

    #[error("A portfolio cannot be combined with --class or --gherkin selections")]
    ConflictingSelection,

    #[error("{failed} of {total} test runs did not pass")]
    TestsFailed { failed: usize, total: usize },

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("Throttle error: {0}")]
    Throttle(#[from] ThrottleError),

    #[error("Portfolio error: {0}")]
    Portfolio(#[from] PortfolioError),

    #[error("Overrides error: {0}")]
    Overrides(#[from] OverridesError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),
}
