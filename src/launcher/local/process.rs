//! Child process spawning for local runs.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::scanner::OutputStreamScanner;
use crate::error::LaunchError;

/// Bytes of standard error kept for the exit report.
pub const STDERR_TAIL_LIMIT: usize = 16 * 1024;

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    /// The command as a single loggable string.
    pub fn display(&self) -> String {
        let mut text = self.program.clone();
        for arg in &self.args {
            text.push(' ');
            text.push_str(arg);
        }
        text
    }
}

/// A process that has been started and can be waited on.
#[async_trait]
pub trait RunningProcess: Send {
    /// Blocks until the process exits and all of its output has been scanned.
    /// Returns the exit code, if the platform reported one.
    async fn wait(&mut self) -> Result<Option<i32>, LaunchError>;

    /// Asks the process to stop now. [`wait`](Self::wait) still has to be
    /// called to reap it.
    async fn kill(&mut self) -> Result<(), LaunchError>;
}

/// Starts processes whose standard output feeds a scanner.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(
        &self,
        command: &LaunchCommand,
        stdout_sink: Arc<OutputStreamScanner>,
    ) -> Result<Box<dyn RunningProcess>, LaunchError>;
}

/// Spawns real operating system processes with tokio.
#[derive(Debug, Default, Clone)]
pub struct TokioProcessSpawner;

impl ProcessSpawner for TokioProcessSpawner {
    fn spawn(
        &self,
        command: &LaunchCommand,
        stdout_sink: Arc<OutputStreamScanner>,
    ) -> Result<Box<dyn RunningProcess>, LaunchError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::ProcessStart {
                command: command.display(),
                reason: e.to_string(),
            })?;

        debug!(pid = ?child.id(), "Spawned {}", command.program);

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(pump_output(stdout, stdout_sink)));
        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(collect_stderr(stderr)));

        Ok(Box::new(TokioProcess {
            child,
            stdout_task,
            stderr_task,
        }))
    }
}

struct TokioProcess {
    child: Child,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<String>>,
}

#[async_trait]
impl RunningProcess for TokioProcess {
    async fn wait(&mut self) -> Result<Option<i32>, LaunchError> {
        let status = self.child.wait().await?;

        if let Some(task) = self.stdout_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.stderr_task.take() {
            if let Ok(stderr) = task.await {
                if !status.success() && !stderr.trim().is_empty() {
                    warn!("Test process exited with {}: {}", status, stderr.trim());
                }
            }
        }

        Ok(status.code())
    }

    async fn kill(&mut self) -> Result<(), LaunchError> {
        debug!(pid = ?self.child.id(), "Killing test process");
        self.child.start_kill()?;
        // Anything the process started may still hold its pipes open.
        if let Some(task) = self.stdout_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        Ok(())
    }
}

/// Feeds output to the scanner one line at a time.
async fn pump_output<R>(output: R, sink: Arc<OutputStreamScanner>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(output);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                sink.write(&line);
            }
            Err(err) => {
                warn!("Failed reading test process output: {}", err);
                break;
            }
        }
    }
}

async fn collect_stderr<R>(output: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(output);
    let mut collected = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                debug!("Process stderr: {}", text.trim_end());
                push_bounded(&mut collected, &text, STDERR_TAIL_LIMIT);
            }
        }
    }
    collected
}

/// Appends `text`, then drops the oldest characters beyond `limit` bytes.
fn push_bounded(tail: &mut String, text: &str, limit: usize) {
    tail.push_str(text);
    if tail.len() > limit {
        let mut cut = tail.len() - limit;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::local::scanner::{ProcessEventSource, TracePatternSet};

    #[test]
    fn test_command_display() {
        let command = LaunchCommand {
            program: "/java/bin/java".to_string(),
            args: vec!["-jar".to_string(), "boot.jar".to_string()],
        };
        assert_eq!(command.display(), "/java/bin/java -jar boot.jar");
    }

    #[test]
    fn test_push_bounded_keeps_newest_text() {
        let mut tail = String::new();
        push_bounded(&mut tail, "old line\n", 12);
        push_bounded(&mut tail, "new line\n", 12);
        assert_eq!(tail, "ne\nnew line\n");

        let mut wide = String::new();
        push_bounded(&mut wide, "ééé", 3);
        assert_eq!(wide, "é");
    }

    #[tokio::test]
    async fn test_stderr_collection_is_bounded() {
        let noise = format!("{}\n", "e".repeat(99)).repeat(STDERR_TAIL_LIMIT / 50);
        let input = format!("early\n{}last\n", noise);

        let collected = collect_stderr(input.as_bytes()).await;

        assert!(collected.len() <= STDERR_TAIL_LIMIT);
        assert!(!collected.contains("early"));
        assert!(collected.ends_with("last\n"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let source: Arc<dyn ProcessEventSource> = Arc::new(TracePatternSet::new().unwrap());
        let (scanner, _alerts) = OutputStreamScanner::new(source);
        let command = LaunchCommand {
            program: "/definitely/not/a/real/program".to_string(),
            args: Vec::new(),
        };

        let result = TokioProcessSpawner.spawn(&command, Arc::new(scanner));

        assert!(matches!(result, Err(LaunchError::ProcessStart { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_stops_a_running_process() {
        let source: Arc<dyn ProcessEventSource> = Arc::new(TracePatternSet::new().unwrap());
        let (scanner, _alerts) = OutputStreamScanner::new(source);
        let command = LaunchCommand {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "exec sleep 30".to_string()],
        };

        let mut process = TokioProcessSpawner.spawn(&command, Arc::new(scanner)).unwrap();
        process.kill().await.unwrap();
        let exit_code = tokio::time::timeout(std::time::Duration::from_secs(5), process.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exit_code, None);
    }
}
