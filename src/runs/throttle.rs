//! Operator-adjustable concurrency limit.
//!
//! The limit can be changed while a batch runs by editing a plain text file
//! holding one integer. Each refresh returns a new [`ThrottleSnapshot`]; the
//! controller itself holds no mutable state.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::ThrottleError;

/// Turns a configured throttle into a limit. Zero or less means no limit.
pub fn effective_limit(configured: i64) -> usize {
    if configured <= 0 {
        usize::MAX
    } else {
        usize::try_from(configured).unwrap_or(usize::MAX)
    }
}

/// Throttle state for one iteration of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleSnapshot {
    pub limit: usize,
    /// The throttle file could not be used on the last refresh.
    pub file_lost: bool,
}

impl ThrottleSnapshot {
    pub fn new(configured: i64) -> Self {
        Self {
            limit: effective_limit(configured),
            file_lost: false,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.limit == usize::MAX
    }

    pub fn allows(&self, in_flight: usize) -> bool {
        in_flight < self.limit
    }
}

impl std::fmt::Display for ThrottleSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_unbounded() {
            write!(f, "unbounded")
        } else {
            write!(f, "{}", self.limit)
        }
    }
}

/// Result of a refresh.
#[derive(Debug)]
pub struct Refreshed {
    pub snapshot: ThrottleSnapshot,
    /// Set only on the refresh where the file first became unusable.
    pub newly_reported: Option<ThrottleError>,
}

/// Reads and writes the optional throttle file.
#[derive(Debug, Clone, Default)]
pub struct ThrottleController {
    path: Option<PathBuf>,
}

impl ThrottleController {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Stores the starting value. Does nothing without a file.
    pub fn write(&self, value: i64) -> Result<(), ThrottleError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        std::fs::write(path, value.to_string()).map_err(|e| ThrottleError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        info!(throttle = value, path = %path.display(), "Wrote throttle file");
        Ok(())
    }

    /// Reads the file. `Ok(None)` when no file is configured.
    pub fn read(&self) -> Result<Option<i64>, ThrottleError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|e| ThrottleError::Read {
            path: display.clone(),
            reason: e.to_string(),
        })?;
        let trimmed = content.trim();
        trimmed
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ThrottleError::InvalidContent {
                path: display,
                content: trimmed.to_string(),
            })
    }

    /// Re-reads the file. On failure the current limit is kept, and the
    /// failure is logged and returned only the first time in a row.
    pub fn refresh(&self, current: &ThrottleSnapshot) -> Refreshed {
        match self.read() {
            Ok(None) => Refreshed {
                snapshot: *current,
                newly_reported: None,
            },
            Ok(Some(value)) => {
                let limit = effective_limit(value);
                if limit != current.limit {
                    info!(from = %current, to = value, "Changing throttle");
                }
                if current.file_lost {
                    info!("Throttle file is readable again");
                }
                Refreshed {
                    snapshot: ThrottleSnapshot {
                        limit,
                        file_lost: false,
                    },
                    newly_reported: None,
                }
            }
            Err(err) => {
                let newly_reported = if current.file_lost {
                    None
                } else {
                    warn!(throttle = %current, "Keeping the current throttle: {}", err);
                    Some(err)
                };
                Refreshed {
                    snapshot: ThrottleSnapshot {
                        limit: current.limit,
                        file_lost: true,
                    },
                    newly_reported,
                }
            }
        }
    }
}
