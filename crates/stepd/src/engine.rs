//! Execution engine seam and the local process engine.
//!
//! An [`Engine`] runs one prepared command, streams its output into an
//! [`OutputSink`], and reports the terminal process state. Engines must watch
//! the cancellation token and return promptly once it fires.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use step_core::ProcessState;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between progress log messages while a step is running.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for draining stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest piece of a line forwarded at once; longer lines arrive in pieces.
const MAX_CHUNK_LEN: usize = 64 * 1024;

/// Exit code reported when the process was terminated by a signal.
const SIGNALED_EXIT_CODE: i32 = -1;

/// Destination for step output bytes. Writes never fail from the caller's
/// point of view; sinks keep their own error state.
pub trait OutputSink: Send + Sync + std::fmt::Debug {
    fn write(&self, chunk: &[u8]);
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("executable not found: {0}")]
    NotFound(String),
    #[error("execution canceled")]
    Canceled,
    #[error("step has no command to run")]
    EmptyCommand,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Fully resolved command for one engine invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub step_id: String,
    /// Script lines, joined with newlines and passed as the last argument.
    pub command: Vec<String>,
    /// Program and leading arguments. Empty means `sh -c`.
    pub entrypoint: Vec<String>,
    pub envs: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl ExecSpec {
    /// Program and argument vector for this spec.
    pub fn argv(&self) -> Result<Vec<String>> {
        let mut argv = if self.entrypoint.is_empty() {
            if self.command.is_empty() {
                return Err(EngineError::EmptyCommand);
            }
            vec!["sh".to_string(), "-c".to_string()]
        } else {
            self.entrypoint.clone()
        };

        if !self.command.is_empty() {
            argv.push(self.command.join("\n"));
        }
        Ok(argv)
    }
}

#[async_trait]
pub trait Engine: Send + Sync + std::fmt::Debug {
    async fn run(
        &self,
        spec: &ExecSpec,
        output: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> Result<ProcessState>;
}

/// Runs steps as child processes of the daemon.
#[derive(Debug, Clone, Default)]
pub struct ProcessEngine;

impl ProcessEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Engine for ProcessEngine {
    async fn run(
        &self,
        spec: &ExecSpec,
        output: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> Result<ProcessState> {
        let argv = spec.argv()?;
        let Some((program, args)) = argv.split_first() else {
            return Err(EngineError::EmptyCommand);
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&spec.envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        debug!(step_id = %spec.step_id, program = %program, "spawning step process");

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::NotFound(program.clone())
            } else {
                EngineError::Io(e)
            }
        })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(pipe_lines(stdout, Arc::clone(&output))));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(pipe_lines(stderr, Arc::clone(&output))));

        let started = Instant::now();
        let outcome = loop {
            tokio::select! {
                result = child.wait() => break result.map(Some),
                () = cancel.cancelled() => {
                    info!(step_id = %spec.step_id, "cancellation requested; killing process");
                    if let Err(err) = child.kill().await {
                        warn!(step_id = %spec.step_id, error = %err, "failed to kill canceled process");
                    }
                    let _ = child.wait().await;
                    break Ok(None);
                }
                () = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    info!(
                        step_id = %spec.step_id,
                        elapsed_sec = started.elapsed().as_secs(),
                        "step still running"
                    );
                }
            }
        };

        // Pipes close once the process is gone; drain what is left.
        drain(&spec.step_id, "stdout", stdout_task).await;
        drain(&spec.step_id, "stderr", stderr_task).await;

        match outcome? {
            Some(status) => {
                let exit_code = status.code().unwrap_or(SIGNALED_EXIT_CODE);
                debug!(step_id = %spec.step_id, exit_code, "step process exited");
                Ok(ProcessState::exited(exit_code))
            }
            None => Err(EngineError::Canceled),
        }
    }
}

/// Forward a pipe into the sink one line at a time, at most
/// `MAX_CHUNK_LEN` bytes per write.
async fn pipe_lines<R: AsyncRead + Unpin>(
    reader: R,
    output: Arc<dyn OutputSink>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_CHUNK_LEN as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Ok(());
        }
        output.write(&line);
    }
}

async fn drain(step_id: &str, stream: &str, task: Option<JoinHandle<std::io::Result<()>>>) {
    let Some(task) = task else {
        return;
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => warn!(step_id, stream, error = %err, "output capture failed"),
        Ok(Err(err)) => warn!(step_id, stream, error = %err, "output task panicked"),
        Err(_) => warn!(step_id, stream, "output capture timed out"),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CaptureSink;
    use super::*;

    fn script(step_id: &str, lines: &[&str]) -> ExecSpec {
        ExecSpec {
            step_id: step_id.to_string(),
            command: lines.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
    }

    #[derive(Debug, Default)]
    struct ChunkSink {
        chunks: std::sync::Mutex<Vec<Vec<u8>>>,
    }

    impl OutputSink for ChunkSink {
        fn write(&self, chunk: &[u8]) {
            self.chunks.lock().unwrap().push(chunk.to_vec());
        }
    }

    #[tokio::test]
    async fn unterminated_output_is_forwarded_in_bounded_pieces() {
        let mut data = vec![b'x'; MAX_CHUNK_LEN * 2 + 100];
        data.extend_from_slice(b"\ntail");
        let sink = Arc::new(ChunkSink::default());

        pipe_lines(&data[..], sink.clone()).await.unwrap();

        let chunks = sink.chunks.lock().unwrap().clone();
        assert!(chunks.iter().all(|c| c.len() <= MAX_CHUNK_LEN));
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[2].len(), 101);
        assert_eq!(chunks[3], b"tail");
        assert_eq!(chunks.concat(), data);
    }

    #[test]
    fn argv_defaults_to_shell() {
        let spec = script("s", &["echo a", "echo b"]);
        assert_eq!(spec.argv().unwrap(), vec!["sh", "-c", "echo a\necho b"]);
    }

    #[test]
    fn argv_uses_entrypoint() {
        let spec = ExecSpec {
            entrypoint: vec!["bash".to_string(), "-ec".to_string()],
            command: vec!["true".to_string()],
            ..Default::default()
        };
        assert_eq!(spec.argv().unwrap(), vec!["bash", "-ec", "true"]);

        let bare = ExecSpec {
            entrypoint: vec!["true".to_string()],
            ..Default::default()
        };
        assert_eq!(bare.argv().unwrap(), vec!["true"]);
    }

    #[test]
    fn argv_rejects_empty_step() {
        assert!(matches!(
            ExecSpec::default().argv(),
            Err(EngineError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn streams_stdout_and_stderr() {
        let sink = Arc::new(CaptureSink::default());
        let spec = script("s1", &["echo out", "echo err 1>&2"]);

        let state = ProcessEngine::new()
            .run(&spec, sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(state.exited);
        assert_eq!(state.exit_code, 0);
        let output = sink.contents();
        assert!(output.contains("out\n"));
        assert!(output.contains("err\n"));
    }

    #[tokio::test]
    async fn reports_nonzero_exit_code() {
        let sink = Arc::new(CaptureSink::default());
        let state = ProcessEngine::new()
            .run(&script("s2", &["exit 3"]), sink, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state, ProcessState::exited(3));
    }

    #[tokio::test]
    async fn passes_envs_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CaptureSink::default());
        let mut spec = script("s3", &["echo \"$GREETING\"", "pwd"]);
        spec.envs
            .insert("GREETING".to_string(), "hello there".to_string());
        spec.working_dir = Some(dir.path().to_path_buf());

        ProcessEngine::new()
            .run(&spec, sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        let output = sink.contents();
        assert!(output.contains("hello there"));
        let canonical = dir.path().canonicalize().unwrap();
        assert!(output.contains(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn cancel_kills_process() {
        let sink = Arc::new(CaptureSink::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = ProcessEngine::new()
            .run(&script("s4", &["exec sleep 30"]), sink, cancel)
            .await;

        assert!(matches!(result, Err(EngineError::Canceled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_entrypoint_is_not_found() {
        let spec = ExecSpec {
            entrypoint: vec!["definitely-not-a-real-binary-xyz".to_string()],
            ..Default::default()
        };
        let result = ProcessEngine::new()
            .run(&spec, Arc::new(CaptureSink::default()), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }
}
