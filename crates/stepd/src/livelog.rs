//! Remote log sink.
//!
//! [`Livelog`] turns the raw byte stream of a step into numbered log lines,
//! ships them to the log service in periodic batches, and uploads the full
//! log when closed. Known failure signatures ("nudges") found in the output
//! are appended to the log on close with a suggested resolution.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use step_core::{LogConfig, LogLine};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::OutputSink;
use crate::log_client::{LogClient, LogClientError};

/// Default interval between batch flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Longest line sent to the service, in bytes. Longer lines are cut.
const MAX_LINE_LEN: usize = 70 * 1024;

/// Upper bound on retained history. Oldest lines are dropped past this.
const MAX_HISTORY_BYTES: usize = 5 * 1024 * 1024;

const TRUNCATED_SUFFIX: &str = "... (log line truncated)";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogStreamError {
    #[error("failed to open log stream: {0}")]
    Open(LogClientError),
    #[error("failed to write log lines: {0}")]
    Write(LogClientError),
    #[error("failed to upload logs: {0}")]
    Upload(LogClientError),
    #[error("failed to close log stream: {0}")]
    Close(LogClientError),
}

/// An output sink with a remote lifecycle.
#[async_trait]
pub trait LogStream: OutputSink {
    async fn open(&self) -> Result<(), LogStreamError>;
    /// Flush everything and finish the stream. Further writes are dropped.
    async fn close(&self) -> Result<(), LogStreamError>;
    /// First error seen on the stream, if any.
    fn error(&self) -> Option<LogStreamError>;
}

/// A known failure signature and what to do about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nudge {
    /// Substring searched for in each output line.
    pub search: String,
    pub resolution: String,
    pub error: String,
}

impl Nudge {
    pub fn new(search: &str, resolution: &str, error: &str) -> Self {
        Self {
            search: search.to_string(),
            resolution: resolution.to_string(),
            error: error.to_string(),
        }
    }
}

pub fn default_nudges() -> Vec<Nudge> {
    vec![
        Nudge::new(
            "Killed",
            "Increase the memory available to the step",
            "out of memory",
        ),
        Nudge::new(
            "SSL certificate problem",
            "Check the certificate chain or disable SSL verification for the repository",
            "SSL certificate error",
        ),
        Nudge::new(
            "Cannot connect to the Docker daemon",
            "Start a Docker daemon before this step runs",
            "Docker daemon not running",
        ),
        Nudge::new(
            "No space left on device",
            "Free up disk space or use a larger volume",
            "disk full",
        ),
    ]
}

#[derive(Debug, Default)]
struct Lines {
    partial: Vec<u8>,
    pending: Vec<LogLine>,
    history: VecDeque<LogLine>,
    history_bytes: usize,
    next_number: usize,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    client: Arc<dyn LogClient>,
    key: String,
    trim_newline_suffix: bool,
    started: Instant,
    lines: Mutex<Lines>,
    error: Mutex<Option<LogStreamError>>,
}

impl Shared {
    fn lines(&self) -> MutexGuard<'_, Lines> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, err: &LogStreamError) {
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err.clone());
        }
    }

    fn make_line(&self, number: usize, raw: &[u8]) -> LogLine {
        let mut message = String::from_utf8_lossy(raw).into_owned();
        if self.trim_newline_suffix {
            if let Some(stripped) = message.strip_suffix('\n') {
                message = stripped.to_string();
            }
        }
        LogLine {
            level: "info".to_string(),
            number,
            message: truncate_line(message),
            timestamp: Utc::now(),
            elapsed: self.started.elapsed().as_secs() as i64,
        }
    }

    fn push(&self, lines: &mut Lines, raw: &[u8]) {
        let line = self.make_line(lines.next_number, raw);
        lines.next_number += 1;
        lines.history_bytes += line.message.len();
        lines.history.push_back(line.clone());
        lines.pending.push(line);

        while lines.history_bytes > MAX_HISTORY_BYTES {
            let Some(dropped) = lines.history.pop_front() else {
                break;
            };
            lines.history_bytes -= dropped.message.len();
        }
    }

    /// Send the pending batch, if any.
    async fn flush(&self) -> Result<(), LogStreamError> {
        let batch = std::mem::take(&mut self.lines().pending);
        if batch.is_empty() {
            return Ok(());
        }
        self.client
            .write(&self.key, &batch)
            .await
            .map_err(LogStreamError::Write)
            .inspect_err(|err| self.record(err))
    }
}

/// Line-batching sink backed by a [`LogClient`].
#[derive(Debug)]
pub struct Livelog {
    shared: Arc<Shared>,
    nudges: Vec<Nudge>,
    flush_interval: Duration,
    stop: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Livelog {
    pub fn new(client: Arc<dyn LogClient>, key: &str, config: LogConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                key: key.to_string(),
                trim_newline_suffix: config.trim_newline_suffix,
                started: Instant::now(),
                lines: Mutex::new(Lines::default()),
                error: Mutex::new(None),
            }),
            nudges: default_nudges(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            stop: CancellationToken::new(),
            flusher: Mutex::new(None),
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    fn start_flusher(&self) {
        let mut slot = self.flusher.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || self.stop.is_cancelled() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let stop = self.stop.clone();
        let interval = self.flush_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = shared.flush().await {
                            warn!(key = %shared.key, error = %err, "periodic log flush failed");
                        }
                    }
                }
            }
        }));
    }

    async fn stop_flusher(&self) {
        self.stop.cancel();
        let handle = self
            .flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(key = %self.shared.key, error = %err, "log flusher task failed");
            }
        }
    }

    /// Lines describing every nudge whose signature appears in the output.
    fn nudge_lines(&self, history: &VecDeque<LogLine>) -> Vec<String> {
        self.nudges
            .iter()
            .filter(|nudge| {
                history
                    .iter()
                    .any(|line| line.message.contains(&nudge.search))
            })
            .flat_map(|nudge| {
                [
                    format!("Error: {}\n", nudge.error),
                    format!("Possible resolution: {}\n", nudge.resolution),
                ]
            })
            .collect()
    }
}

impl OutputSink for Livelog {
    fn write(&self, chunk: &[u8]) {
        let mut lines = self.shared.lines();
        if lines.closed {
            return;
        }

        lines.partial.extend_from_slice(chunk);
        while let Some(pos) = lines.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = lines.partial.drain(..=pos).collect();
            self.shared.push(&mut lines, &raw);
        }
        // A runaway line with no newline is emitted in pieces.
        if lines.partial.len() > MAX_LINE_LEN {
            let raw = std::mem::take(&mut lines.partial);
            self.shared.push(&mut lines, &raw);
        }
    }
}

#[async_trait]
impl LogStream for Livelog {
    async fn open(&self) -> Result<(), LogStreamError> {
        self.start_flusher();
        self.shared
            .client
            .open(&self.shared.key)
            .await
            .map_err(LogStreamError::Open)
            .inspect_err(|err| self.shared.record(err))
    }

    async fn close(&self) -> Result<(), LogStreamError> {
        {
            let mut lines = self.shared.lines();
            if lines.closed {
                return Ok(());
            }
            lines.closed = true;
        }
        self.stop_flusher().await;

        let history = {
            let mut lines = self.shared.lines();
            if !lines.partial.is_empty() {
                let raw = std::mem::take(&mut lines.partial);
                self.shared.push(&mut lines, &raw);
            }
            let nudges = self.nudge_lines(&lines.history);
            for text in &nudges {
                self.shared.push(&mut lines, text.as_bytes());
            }
            lines.history.iter().cloned().collect::<Vec<_>>()
        };

        let mut first: Option<LogStreamError> = None;

        if let Err(err) = self.shared.flush().await {
            first.get_or_insert(err);
        }

        debug!(key = %self.shared.key, lines = history.len(), "uploading full log");
        if let Err(err) = self.shared.client.upload(&self.shared.key, &history).await {
            let err = LogStreamError::Upload(err);
            self.shared.record(&err);
            first.get_or_insert(err);
        }

        if let Err(err) = self.shared.client.close(&self.shared.key).await {
            let err = LogStreamError::Close(err);
            self.shared.record(&err);
            first.get_or_insert(err);
        }

        first.map_or(Ok(()), Err)
    }

    fn error(&self) -> Option<LogStreamError> {
        self.shared
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for Livelog {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn truncate_line(mut message: String) -> String {
    if message.len() <= MAX_LINE_LEN {
        return message;
    }
    let mut cut = MAX_LINE_LEN;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    message.truncate(cut);
    message.push_str(TRUNCATED_SUFFIX);
    message
}
