//! Launchers start test runs and report on them.
//!
//! The submission scheduler only ever talks to a [`Launcher`]. Two
//! implementations exist:
//!
//! - [`RemoteLauncher`]: submits to the ecosystem's REST API and polls it.
//! - [`LocalLauncher`]: spawns one child process per test class and learns
//!   about it by scanning the process's trace output.
//!
//! # Architecture
//!
//! ```text
//!                  ┌────────────────────────┐
//!                  │ RunSubmissionScheduler │
//!                  └───────────┬────────────┘
//!                              │ submit / status / details
//!               ┌──────────────┴──────────────┐
//!               ▼                             ▼
//!       ┌───────────────┐             ┌───────────────┐
//!       │RemoteLauncher │             │ LocalLauncher │
//!       └───────┬───────┘             └───────┬───────┘
//!               │ HTTP                        │ spawn + scan stdout
//!               ▼                             ▼
//!         REST API                      child process
//! ```
//!
//! Launchers never touch the scheduler's bookkeeping. They return what the
//! backend says, and the scheduler decides what that means.

pub mod local;
pub mod remote;
pub mod types;

use async_trait::async_trait;

use crate::error::LaunchError;

pub use local::{LocalLaunchConfig, LocalLauncher};
pub use remote::{RemoteLauncher, RemoteLauncherConfig};
pub use types::{
    DetailedRun, SubmitRequest, TestMethod, TestRunSnapshot, TestRuns, TestStructure,
    RESULT_UNKNOWN, STATUS_FINISHED,
};

/// Capability used by the scheduler to start and observe runs.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Submits one test class. The returned runs carry the assigned run name.
    async fn submit_test_run(&self, request: &SubmitRequest) -> Result<TestRuns, LaunchError>;

    /// Returns the current view of every run in the group.
    async fn get_runs_by_group(&self, group: &str) -> Result<TestRuns, LaunchError>;

    /// Returns method-level detail for one run.
    async fn get_run_by_id(&self, run_id: &str) -> Result<DetailedRun, LaunchError>;
}
