//! Scans a child process's trace output for lifecycle events.
//!
//! The test process offers no structured IPC. Its trace text is the only
//! channel, so the scanner decodes a tiny line protocol out of it:
//!
//! | Event             | Trace text                                        |
//! |-------------------|---------------------------------------------------|
//! | run id allocated  | `Allocated Run Name <runid> to this run`          |
//! | RAS location      | `Result Archive Stores are [<location>]`          |
//! | shutdown          | `Framework shutdown`                              |
//!
//! The patterns live behind [`ProcessEventSource`] so a different framework
//! version can plug in its own set without touching the supervisor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::LaunchError;

/// Version of the trace line protocol understood by [`TracePatternSet`].
pub const TRACE_PROTOCOL_VERSION: u32 = 1;

/// Slack in the alert channel. Writers never wait on it.
pub const ALERT_CHANNEL_CAPACITY: usize = 10;

/// Bytes of the most recent output kept for diagnostics.
pub const OUTPUT_TAIL_LIMIT: usize = 64 * 1024;

const RUN_ID_PATTERN: &str = r"Allocated Run Name (?P<runid>\S*) to this run";
const RAS_LOCATION_PATTERN: &str = r"Result Archive Stores are \[(?P<ras_location>.*)\]";
const SHUTDOWN_EYE_CATCHER: &str = "Framework shutdown";

/// Something of interest seen in the process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    RunIdAllocated(String),
    RasLocation(String),
    FrameworkShutdown,
}

/// Decodes process events out of raw output fragments.
pub trait ProcessEventSource: Send + Sync {
    /// Version of the line protocol this source decodes.
    fn protocol_version(&self) -> u32;

    /// Returns every event found in `fragment`, in a fixed order.
    fn scan(&self, fragment: &str) -> Vec<ProcessEvent>;
}

/// The regex-based pattern set for protocol version 1.
#[derive(Debug, Clone)]
pub struct TracePatternSet {
    run_id: Regex,
    ras_location: Regex,
    shutdown: String,
}

impl TracePatternSet {
    /// Builds the standard pattern set.
    pub fn new() -> Result<Self, LaunchError> {
        Self::with_patterns(RUN_ID_PATTERN, RAS_LOCATION_PATTERN, SHUTDOWN_EYE_CATCHER)
    }

    /// Builds a custom pattern set. The run id pattern must have a `runid`
    /// group and the location pattern a `ras_location` group.
    pub fn with_patterns(
        run_id: &str,
        ras_location: &str,
        shutdown: impl Into<String>,
    ) -> Result<Self, LaunchError> {
        Ok(Self {
            run_id: Regex::new(run_id)?,
            ras_location: Regex::new(ras_location)?,
            shutdown: shutdown.into(),
        })
    }
}

impl ProcessEventSource for TracePatternSet {
    fn protocol_version(&self) -> u32 {
        TRACE_PROTOCOL_VERSION
    }

    fn scan(&self, fragment: &str) -> Vec<ProcessEvent> {
        let mut events = Vec::new();

        if let Some(id) = self
            .run_id
            .captures(fragment)
            .and_then(|caps| caps.name("runid"))
        {
            events.push(ProcessEvent::RunIdAllocated(id.as_str().to_string()));
        }

        if let Some(location) = self
            .ras_location
            .captures(fragment)
            .and_then(|caps| caps.name("ras_location"))
        {
            events.push(ProcessEvent::RasLocation(location.as_str().to_string()));
        }

        if fragment.contains(&self.shutdown) {
            events.push(ProcessEvent::FrameworkShutdown);
        }

        events
    }
}

/// What the scanner has learned so far. Each field is written at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detected {
    pub run_id: Option<String>,
    pub ras_location: Option<String>,
    pub shutdown: bool,
}

#[derive(Debug, Default)]
struct ScannerState {
    tail: VecDeque<u8>,
    detected: Detected,
}

/// A write sink for child-process output which raises alerts on events.
pub struct OutputStreamScanner {
    source: Arc<dyn ProcessEventSource>,
    state: Mutex<ScannerState>,
    alerts: mpsc::Sender<ProcessEvent>,
}

impl OutputStreamScanner {
    /// Creates a scanner and the receiving end of its alert channel.
    pub fn new(source: Arc<dyn ProcessEventSource>) -> (Self, mpsc::Receiver<ProcessEvent>) {
        let (alerts, receiver) = mpsc::channel(ALERT_CHANNEL_CAPACITY);
        let scanner = Self {
            source,
            state: Mutex::new(ScannerState::default()),
            alerts,
        };
        (scanner, receiver)
    }

    fn lock(&self) -> MutexGuard<'_, ScannerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accepts a fragment of output. Never blocks on the alert channel.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let fragment = String::from_utf8_lossy(bytes);
        let mut fresh = Vec::new();

        {
            let mut state = self.lock();
            state.tail.extend(bytes);
            let excess = state.tail.len().saturating_sub(OUTPUT_TAIL_LIMIT);
            state.tail.drain(..excess);

            let line = fragment.trim().replace("\r\n", "\n").replace('\r', "\n");
            match &state.detected.run_id {
                Some(run_id) => debug!(run_id = %run_id, "Process output: {}", line),
                None => debug!("Process output: {}", line),
            }

            for event in self.source.scan(&fragment) {
                let is_new = match &event {
                    ProcessEvent::RunIdAllocated(id) if state.detected.run_id.is_none() => {
                        info!(run_id = %id, "Detected allocated run name in process output");
                        state.detected.run_id = Some(id.clone());
                        true
                    }
                    ProcessEvent::RasLocation(location)
                        if state.detected.ras_location.is_none() =>
                    {
                        info!(ras_location = %location, "Detected result archive store location");
                        state.detected.ras_location = Some(location.clone());
                        true
                    }
                    ProcessEvent::FrameworkShutdown if !state.detected.shutdown => {
                        debug!("Detected framework shutdown in process output");
                        state.detected.shutdown = true;
                        true
                    }
                    _ => false,
                };
                if is_new {
                    fresh.push(event);
                }
            }
        }

        for event in fresh {
            if let Err(err) = self.alerts.try_send(event) {
                warn!("Dropped process alert, nobody is draining the channel: {}", err);
            }
        }

        bytes.len()
    }

    /// Snapshot of everything detected so far.
    pub fn detected(&self) -> Detected {
        self.lock().detected.clone()
    }

    pub fn run_id(&self) -> Option<String> {
        self.lock().detected.run_id.clone()
    }

    pub fn ras_location(&self) -> Option<String> {
        self.lock().detected.ras_location.clone()
    }

    /// The last [`OUTPUT_TAIL_LIMIT`] bytes of output, lossily decoded.
    pub fn output_tail(&self) -> String {
        let state = self.lock();
        let bytes: Vec<u8> = state.tail.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn protocol_version(&self) -> u32 {
        self.source.protocol_version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> (OutputStreamScanner, mpsc::Receiver<ProcessEvent>) {
        let source: Arc<dyn ProcessEventSource> = Arc::new(TracePatternSet::new().unwrap());
        OutputStreamScanner::new(source)
    }

    #[test]
    fn test_run_id_allocation_publishes_one_alert() {
        let (scanner, mut alerts) = scanner();

        scanner.write(b"Allocated Run Name L100 to this run\n");

        assert_eq!(scanner.run_id().as_deref(), Some("L100"));
        assert_eq!(
            alerts.try_recv().unwrap(),
            ProcessEvent::RunIdAllocated("L100".to_string())
        );
        assert!(alerts.try_recv().is_err());
    }

    #[test]
    fn test_ras_location_detected() {
        let (scanner, mut alerts) = scanner();

        scanner.write(
            b"12:00:01 INFO d.g.f.FrameworkInitialisation - Result Archive Stores are [file:///home/me/.testrun/ras]\n",
        );

        assert_eq!(
            scanner.ras_location().as_deref(),
            Some("file:///home/me/.testrun/ras")
        );
        assert!(matches!(
            alerts.try_recv().unwrap(),
            ProcessEvent::RasLocation(_)
        ));
    }

    #[test]
    fn test_multiple_matches_in_one_write_each_alert() {
        let (scanner, mut alerts) = scanner();

        scanner.write(
            b"Allocated Run Name L7 to this run\nResult Archive Stores are [file:///tmp/ras]\nd.g.f.Framework - Framework shutdown\n",
        );

        let mut received = Vec::new();
        while let Ok(event) = alerts.try_recv() {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                ProcessEvent::RunIdAllocated("L7".to_string()),
                ProcessEvent::RasLocation("file:///tmp/ras".to_string()),
                ProcessEvent::FrameworkShutdown,
            ]
        );
        assert!(scanner.detected().shutdown);
    }

    #[test]
    fn test_repeated_match_does_not_alert_again() {
        let (scanner, mut alerts) = scanner();

        scanner.write(b"Allocated Run Name L1 to this run\n");
        scanner.write(b"Allocated Run Name L2 to this run\n");

        assert_eq!(scanner.run_id().as_deref(), Some("L1"));
        assert!(alerts.try_recv().is_ok());
        assert!(alerts.try_recv().is_err());
    }

    #[test]
    fn test_writer_never_blocks_when_nobody_listens() {
        let source: Arc<dyn ProcessEventSource> = Arc::new(
            TracePatternSet::with_patterns(
                r"Allocated Run Name (?P<runid>\S*) to this run",
                r"Result Archive Stores are \[(?P<ras_location>.*)\]",
                "stop",
            )
            .unwrap(),
        );
        let (scanner, alerts) = OutputStreamScanner::new(source);
        drop(alerts);

        for i in 0..(ALERT_CHANNEL_CAPACITY * 3) {
            let line = format!("unrelated line {}\n", i);
            assert_eq!(scanner.write(line.as_bytes()), line.len());
        }
        scanner.write(b"Allocated Run Name L3 to this run\nstop\n");

        assert_eq!(scanner.run_id().as_deref(), Some("L3"));
        assert!(scanner.detected().shutdown);
        assert!(scanner.output_tail().contains("unrelated line 0"));
    }

    #[test]
    fn test_output_tail_is_bounded() {
        let (scanner, _alerts) = scanner();
        let line = format!("{}\n", "x".repeat(1023));

        scanner.write(b"first line\n");
        for _ in 0..(OUTPUT_TAIL_LIMIT / line.len() + 8) {
            scanner.write(line.as_bytes());
        }
        scanner.write(b"Allocated Run Name L8 to this run\n");

        let tail = scanner.output_tail();
        assert_eq!(tail.len(), OUTPUT_TAIL_LIMIT);
        assert!(!tail.contains("first line"));
        assert!(tail.ends_with("Allocated Run Name L8 to this run\n"));
        assert_eq!(scanner.run_id().as_deref(), Some("L8"));
    }

    #[test]
    fn test_unrelated_output_is_ignored() {
        let (scanner, mut alerts) = scanner();

        let line = b"Run Name is allocated later\n";
        let written = scanner.write(line);

        assert_eq!(written, line.len());
        assert_eq!(scanner.detected(), Detected::default());
        assert!(alerts.try_recv().is_err());
        assert_eq!(scanner.protocol_version(), TRACE_PROTOCOL_VERSION);
    }
}
