//! Step executor.
//!
//! Owns the lifecycle of every step started on this daemon:
//! - `start_step` registers the step and runs it on a background task, at
//!   most once per identifier
//! - `poll_step` waits for the terminal status
//! - `stream_output` subscribes to the step's live output
//!
//! All shared state sits in one [`Registry`] behind a mutex that is only held
//! for map operations, never across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use step_core::{
    ExecutionStatus, LogConfig, OutputV2, PollStepResponse, ProcessState, StepKind, StepRequest,
    TelemetryData, TiConfig, INFRA_ERROR_EXIT_CODE,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Dispatcher, RunResult};
use crate::engine::OutputSink;
use crate::error::StepError;
use crate::livelog::{Livelog, LogStream, DEFAULT_FLUSH_INTERVAL};
use crate::log_client::LogClient;
use crate::replacer::Replacer;
use crate::scope::RunScope;
use crate::step_log::{StepLog, StepLogError};

/// How long `stream_output` waits for a step to register its log.
pub const STREAM_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval between log registry checks while waiting.
pub const STREAM_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("step {0} has not started")]
    NotStarted(String),
    #[error("request canceled")]
    Canceled,
    #[error(transparent)]
    Subscribe(#[from] StepLogError),
    #[error("step {0} finished without delivering a status")]
    Delivery(String),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Recorded status of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStatus {
    pub status: ExecutionStatus,
    pub state: Option<ProcessState>,
    pub error: Option<StepError>,
    pub outputs: HashMap<String, String>,
    pub artifact: Vec<u8>,
    pub output_v2: Vec<OutputV2>,
    pub optimization_state: String,
    pub telemetry: Option<TelemetryData>,
}

impl StepStatus {
    fn running() -> Self {
        Self {
            status: ExecutionStatus::Running,
            state: None,
            error: None,
            outputs: HashMap::new(),
            artifact: Vec::new(),
            output_v2: Vec::new(),
            optimization_state: String::new(),
            telemetry: None,
        }
    }

    fn complete(result: RunResult) -> Self {
        Self {
            status: ExecutionStatus::Complete,
            state: result.state,
            error: result.error,
            outputs: result.outputs,
            artifact: result.artifact,
            output_v2: result.output_v2,
            optimization_state: result.optimization_state,
            telemetry: result.telemetry,
        }
    }

    /// Poll response for this status. Process failures are folded into the
    /// error text; a step-level error forces the infrastructure exit code.
    pub fn to_response(&self) -> PollStepResponse {
        let mut response = PollStepResponse {
            exited: true,
            outputs: self.outputs.clone(),
            artifact: self.artifact.clone(),
            output_v2: self.output_v2.clone(),
            optimization_state: self.optimization_state.clone(),
            telemetry: self.telemetry.clone(),
            ..Default::default()
        };

        let mut err = self.error.clone();
        if let Some(state) = self.state {
            response.exited = state.exited;
            response.exit_code = state.exit_code;
            response.oom_killed = state.oom_killed;
            if state.oom_killed {
                err = Some(StepError::append(err, StepError::OomKilled));
            } else if state.exit_code != 0 {
                err = Some(StepError::append(err, StepError::ExitStatus(state.exit_code)));
            }
        }

        if self.error.is_some() {
            response.exit_code = INFRA_ERROR_EXIT_CODE;
        }
        if let Some(err) = err {
            response.error = err.to_string();
        }
        response
    }
}

/// Output of a step from some offset onwards.
#[derive(Debug)]
pub struct OutputStream {
    /// Output already produced when the subscription started.
    pub history: Vec<u8>,
    /// Subsequent chunks. Closed when the step ends or the caller cancels.
    pub live: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Tunables. Defaults match production behavior.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    pub stream_wait_timeout: Duration,
    pub stream_retry_interval: Duration,
    pub log_flush_interval: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            stream_wait_timeout: STREAM_WAIT_TIMEOUT,
            stream_retry_interval: STREAM_RETRY_INTERVAL,
            log_flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    status: HashMap<String, StepStatus>,
    logs: HashMap<String, Arc<StepLog>>,
    waiters: HashMap<String, Vec<oneshot::Sender<StepStatus>>>,
}

/// Everything a run needs besides the request itself.
#[derive(Debug)]
struct RunContext {
    secrets: Vec<String>,
    log_client: Arc<dyn LogClient>,
    ti: Option<TiConfig>,
    log_config: LogConfig,
}

#[derive(Debug)]
pub struct StepExecutor {
    dispatcher: Dispatcher,
    registry: Mutex<Registry>,
    /// Parent of every run scope; cancelled on shutdown.
    shutdown: CancellationToken,
    options: ExecutorOptions,
}

impl StepExecutor {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            registry: Mutex::new(Registry::default()),
            shutdown: CancellationToken::new(),
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Cancel every in-flight run.
    pub fn shutdown(&self) {
        info!("cancelling in-flight steps");
        self.shutdown.cancel();
    }

    /// Execution status of `id`.
    pub fn status(&self, id: &str) -> ExecutionStatus {
        self.lock()
            .status
            .get(id)
            .map_or(ExecutionStatus::NotStarted, |s| s.status)
    }

    /// Start a step in the background. Starting an identifier that is
    /// already known is a no-op.
    pub fn start_step(
        self: &Arc<Self>,
        req: StepRequest,
        secrets: Vec<String>,
        log_client: Arc<dyn LogClient>,
        ti: Option<TiConfig>,
        log_config: LogConfig,
    ) -> Result<()> {
        if req.id.is_empty() {
            return Err(ExecutorError::BadRequest("ID needs to be set".to_string()));
        }

        {
            let mut registry = self.lock();
            if registry.status.contains_key(&req.id) {
                debug!(step_id = %req.id, "step already started");
                return Ok(());
            }
            registry.status.insert(req.id.clone(), StepStatus::running());
        }

        info!(
            step_id = %req.id,
            name = %req.name,
            kind = req.kind.as_str(),
            detach = req.detach,
            "starting step"
        );

        let ctx = RunContext {
            secrets,
            log_client,
            ti,
            log_config,
        };
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let id = req.id.clone();
            let runner = Arc::clone(&executor);
            // Run on a nested task so a panic still completes the step.
            let status = match tokio::spawn(async move { runner.execute(req, ctx).await }).await {
                Ok(status) => status,
                Err(err) => {
                    error!(step_id = %id, error = %err, "step execution panicked");
                    StepStatus::complete(RunResult {
                        error: Some(StepError::Engine("step execution panicked".to_string())),
                        ..Default::default()
                    })
                }
            };
            executor.complete(&id, status);
        });

        Ok(())
    }

    /// Wait for the step to complete and return its converted status.
    pub async fn poll_step(&self, id: &str) -> Result<PollStepResponse> {
        if id.is_empty() {
            return Err(ExecutorError::BadRequest("ID needs to be set".to_string()));
        }

        let receiver = {
            let mut registry = self.lock();
            match registry.status.get(id) {
                None => return Err(ExecutorError::NotStarted(id.to_string())),
                Some(status) if status.status == ExecutionStatus::Complete => {
                    return Ok(status.to_response());
                }
                Some(_) => {
                    let (tx, rx) = oneshot::channel();
                    registry.waiters.entry(id.to_string()).or_default().push(tx);
                    rx
                }
            }
        };

        let status = receiver
            .await
            .map_err(|_| ExecutorError::Delivery(id.to_string()))?;
        Ok(status.to_response())
    }

    /// Subscribe to a step's output from `offset`.
    ///
    /// Callers may arrive just before the step is started, so the log is
    /// looked up repeatedly for a bounded time. Cancelling `cancel` ends the
    /// subscription but never the step.
    pub async fn stream_output(
        &self,
        id: &str,
        offset: usize,
        cancel: CancellationToken,
    ) -> Result<OutputStream> {
        if id.is_empty() {
            return Err(ExecutorError::BadRequest("ID needs to be set".to_string()));
        }

        let started = Instant::now();
        let log = loop {
            let found = self.lock().logs.get(id).cloned();
            if let Some(log) = found {
                break log;
            }
            if started.elapsed() >= self.options.stream_wait_timeout {
                return Err(ExecutorError::NotStarted(id.to_string()));
            }
            tokio::select! {
                () = tokio::time::sleep(self.options.stream_retry_interval) => {}
                () = cancel.cancelled() => return Err(ExecutorError::Canceled),
            }
        };

        let subscription = log.subscribe(offset)?;
        let subscriber = subscription.id;
        debug!(step_id = %id, offset, buffered = log.len(), "output subscriber attached");

        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = log.done() => {}
            }
            log.unsubscribe(subscriber);
        });

        Ok(OutputStream {
            history: subscription.history,
            live: subscription.receiver,
        })
    }

    fn complete(&self, id: &str, status: StepStatus) {
        let waiters = {
            let mut registry = self.lock();
            registry.status.insert(id.to_string(), status.clone());
            registry.waiters.remove(id).unwrap_or_default()
        };

        info!(
            step_id = %id,
            waiters = waiters.len(),
            failed = status.error.is_some(),
            "step complete"
        );
        for waiter in waiters {
            // The poller may have gone away.
            let _ = waiter.send(status.clone());
        }
    }

    async fn execute(&self, req: StepRequest, ctx: RunContext) -> StepStatus {
        let result = if req.log_drone {
            self.execute_drone(req, ctx.ti).await
        } else {
            self.execute_primary(req, ctx).await
        };
        StepStatus::complete(result)
    }

    /// Compatibility path: output goes straight into the local log buffer.
    async fn execute_drone(&self, mut req: StepRequest, ti: Option<TiConfig>) -> RunResult {
        let scope = RunScope::new(&self.shutdown, req.timeout_duration());
        let log = self.register_log(&req.id, &scope);
        req.kind = StepKind::Run;

        if req.detach {
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                let result = run_drone(&dispatcher, &req, log, ti.as_ref(), &scope).await;
                debug!(step_id = %req.id, failed = result.error.is_some(), "detached step finished");
            });
            return detached();
        }

        run_drone(&self.dispatcher, &req, log, ti.as_ref(), &scope).await
    }

    /// Primary path: output is redacted and shipped to the log service, with
    /// a local mirror for streaming subscribers.
    async fn execute_primary(&self, req: StepRequest, ctx: RunContext) -> RunResult {
        let scope = RunScope::new(&self.shutdown, req.timeout_duration());
        let log = self.register_log(&req.id, &scope);

        let livelog = Livelog::new(ctx.log_client, &req.log_key, ctx.log_config)
            .with_flush_interval(self.options.log_flush_interval);
        let mirror: Arc<dyn OutputSink> = log;
        let writer = Arc::new(Replacer::new(Arc::new(livelog), &ctx.secrets).with_mirror(mirror));

        if let Err(err) = writer.open().await {
            error!(step_id = %req.id, key = %req.log_key, error = %err, "could not open log stream");
        }

        if req.detach {
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                let output: Arc<dyn OutputSink> = writer.clone();
                let result = dispatcher
                    .run(&req, output, ctx.ti.as_ref(), scope.token())
                    .await;
                drop(scope);
                if let Err(err) = writer.close().await {
                    warn!(step_id = %req.id, error = %err, "failed to close log stream");
                }
                debug!(step_id = %req.id, failed = result.error.is_some(), "detached step finished");
            });
            return detached();
        }

        let output: Arc<dyn OutputSink> = writer.clone();
        let mut result = self
            .dispatcher
            .run(&req, output, ctx.ti.as_ref(), scope.token())
            .await;
        let scope_err = scope.err();
        // Ends the local buffer before the remote upload.
        drop(scope);

        let mut aggregate = result.error.take();
        if let Err(err) = writer.close().await {
            aggregate = Some(StepError::append(aggregate, err.into()));
        }

        if let Some(err) = scope_err {
            warn!(step_id = %req.id, error = %err, "step execution canceled");
            return RunResult {
                telemetry: result.telemetry,
                error: Some(err),
                ..Default::default()
            };
        }

        if let Some(state) = result.state {
            if state.exit_code != 0 {
                if let Some(err) = writer.error().map(StepError::from) {
                    if !aggregate.as_ref().is_some_and(|agg| agg.contains(&err)) {
                        aggregate = Some(StepError::append(aggregate, err));
                    }
                }
            }
            if state.oom_killed {
                info!(step_id = %req.id, "received oom kill");
            } else {
                info!(step_id = %req.id, exit_code = state.exit_code, "received exit code");
            }
        }

        result.error = aggregate;
        result
    }

    fn register_log(&self, id: &str, scope: &RunScope) -> Arc<StepLog> {
        let log = StepLog::new(scope.token());
        self.lock().logs.insert(id.to_string(), Arc::clone(&log));
        log
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn detached() -> RunResult {
    RunResult {
        state: Some(ProcessState::detached()),
        ..Default::default()
    }
}

async fn run_drone(
    dispatcher: &Dispatcher,
    req: &StepRequest,
    log: Arc<StepLog>,
    ti: Option<&TiConfig>,
    scope: &RunScope,
) -> RunResult {
    let result = dispatcher.run(req, log, ti, scope.token()).await;

    if let Some(err) = scope.err() {
        warn!(step_id = %req.id, error = %err, "step execution canceled");
        return RunResult {
            error: Some(err),
            ..Default::default()
        };
    }
    if let Some(err) = &result.error {
        warn!(step_id = %req.id, error = %err, "step execution failed");
        return RunResult {
            error: result.error,
            ..Default::default()
        };
    }

    if let Some(state) = result.state {
        if state.oom_killed {
            info!(step_id = %req.id, "step received oom kill");
        } else {
            info!(step_id = %req.id, exit_code = state.exit_code, "step terminated");
        }
    }
    RunResult {
        state: result.state,
        ..Default::default()
    }
}
