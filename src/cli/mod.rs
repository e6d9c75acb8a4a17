//! Command-line interface for testrunctl.
//!
//! Provides the `runs` commands for submitting tests and preparing
//! portfolios.

mod commands;

pub use commands::{
    parse_cli, run, run_with_cli, scheduler_config, select_tests, submit, Cli, CommonArgs,
    SelectionArgs,
};
