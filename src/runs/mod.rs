//! Submitting a batch of test runs and following them to completion.
//!
//! - **RunSets**: the ready queue plus the submitted, finished, and lost maps
//! - **RunSubmissionScheduler**: the poll loop that moves runs between them
//! - **StatusReconciler**: compares `submitted` with the backend's group view
//! - **ThrottleController**: in-flight limit, optionally followed from a file
//!
//! # Architecture
//!
//! ```text
//!   portfolio.yaml ──► ready ──submit──► submitted ──reconcile──┬─► finished
//!                        │                   ▲                  │
//!                        │                   │ poll             └─► lost
//!                        └── submit failed ──┼────────────────────► lost
//!                                            │
//!                                   ┌────────┴────────┐
//!                                   │    Launcher     │
//!                                   │ (remote/local)  │
//!                                   └─────────────────┘
//! ```
//!
//! Once every run is in `finished` or `lost` the reports in [`report`]
//! summarise the batch.

pub mod overrides;
pub mod portfolio;
pub mod reconcile;
pub mod record;
pub mod report;
pub mod scheduler;
pub mod throttle;

pub use overrides::build_override_map;
pub use portfolio::{read_portfolio, write_portfolio, Portfolio, PortfolioClass};
pub use reconcile::{apply_snapshot, ReconcileSummary, StatusReconciler};
pub use record::{MethodResult, RunRecord, RunSets};
pub use report::{count_failed, final_report, write_json_report, write_yaml_report};
pub use scheduler::{RunSubmissionScheduler, SchedulerConfig, SubmissionOutcome};
pub use throttle::{ThrottleController, ThrottleSnapshot};
