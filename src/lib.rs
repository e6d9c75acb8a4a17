//! testrun_ctl: submit automated test runs and follow them to completion.
//!
//! Tests are submitted either to a remote ecosystem API or as local child
//! processes, throttled, polled until every run has finished or been lost,
//! and summarised in human-readable and machine-readable reports.

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod launcher;
pub mod runs;

// Re-export commonly used error types
pub use error::{
    LaunchError, OverridesError, PortfolioError, ReportError, SubmitError, ThrottleError,
};
