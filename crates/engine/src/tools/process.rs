//! Child process runner shared by the tool adapters.
//!
//! Spawns a tool with piped output, streams both pipes line by line (ncnn
//! tools and ffmpeg redraw progress with `\r`, so carriage returns also end a
//! line), keeps the tail of stderr for diagnostics and kills the child when
//! the cancellation token fires.

use super::ToolError;
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Lines of stderr kept for the failure message.
const STDERR_TAIL_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives tool output while the process runs.
pub trait LineSink: Send {
    fn on_line(&mut self, stream: OutputStream, line: &str);

    /// Called on every poll tick when the run was started with one.
    fn on_tick(&mut self) {}
}

/// Splits a byte stream on `\n` and `\r`, dropping blank lines.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                if let Some(line) = self.take_line() {
                    lines.push(line);
                }
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Returns whatever is left after the stream closed.
    pub fn finish(&mut self) -> Option<String> {
        self.take_line()
    }

    fn take_line(&mut self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

/// Bounded buffer of the most recent stderr lines.
#[derive(Debug)]
struct StderrTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, line: &str) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    fn joined(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

fn spawn_reader<R>(
    mut reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut splitter = LineSplitter::default();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for line in splitter.push(&buf[..n]) {
                        if tx.send((stream, line)).is_err() {
                            return;
                        }
                    }
                }
            }
        }
        if let Some(line) = splitter.finish() {
            let _ = tx.send((stream, line));
        }
    })
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Runs `cmd` to completion, streaming its output into `sink`.
///
/// # Arguments
/// * `tool` - Name used in errors and log fields
/// * `cmd` - Fully configured command; pipes are set up here
/// * `sink` - Receives every non-blank output line
/// * `poll` - Optional interval for `LineSink::on_tick`
/// * `cancel` - Kills the child and returns `ToolError::Cancelled` when fired
///
/// # Returns
/// `Ok(())` on a zero exit status, `ToolError::ExecutionFailure` carrying the
/// stderr tail otherwise.
pub async fn run_tool(
    tool: &str,
    mut cmd: Command,
    sink: &mut dyn LineSink,
    poll: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<(), ToolError> {
    if cancel.is_cancelled() {
        return Err(ToolError::Cancelled);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(tool, command = ?cmd.as_std(), "Spawning tool");
    let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
        tool: tool.to_string(),
        source,
    })?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, OutputStream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, OutputStream::Stderr, tx.clone());
    }
    drop(tx);

    let mut ticker = poll.map(|period| {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });
    let mut tail = StderrTail::new(STDERR_TAIL_LINES);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(tool, "Cancelling tool run");
                if let Err(e) = child.kill().await {
                    warn!(tool, error = %e, "Failed to kill tool process");
                }
                return Err(ToolError::Cancelled);
            }
            message = rx.recv() => match message {
                Some((stream, line)) => {
                    if stream == OutputStream::Stderr {
                        tail.push(&line);
                    }
                    trace!(tool, ?stream, "{}", line);
                    sink.on_line(stream, &line);
                }
                None => break,
            },
            _ = next_tick(&mut ticker) => sink.on_tick(),
        }
    }

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(tool, error = %e, "Failed to kill tool process");
            }
            return Err(ToolError::Cancelled);
        }
        status = child.wait() => status?,
    };

    if status.success() {
        debug!(tool, "Tool finished");
        Ok(())
    } else {
        Err(ToolError::ExecutionFailure {
            tool: tool.to_string(),
            status: status.to_string(),
            stderr: tail.joined(),
        })
    }
}

/// Runs `cmd` and returns its stdout. For short-lived queries like ffprobe.
pub async fn capture_output(
    tool: &str,
    mut cmd: Command,
    cancel: &CancellationToken,
) -> Result<String, ToolError> {
    cmd.stdin(Stdio::null()).kill_on_drop(true);

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ToolError::Cancelled),
        output = cmd.output() => output.map_err(|source| ToolError::Spawn {
            tool: tool.to_string(),
            source,
        })?,
    };

    if !output.status.success() {
        return Err(ToolError::ExecutionFailure {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
