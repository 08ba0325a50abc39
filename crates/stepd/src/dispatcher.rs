//! Run dispatcher: turns a step request into an engine invocation.
//!
//! Each step kind is prepared differently (plain command, structured test
//! run, legacy test run) but every path returns the same [`RunResult`], so
//! the executor aggregates results without caring about the kind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use step_core::{
    OptimizationState, OutputType, OutputV2, ProcessState, StepKind, StepRequest, TelemetryData,
    TiConfig,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::{Engine, EngineError, ExecSpec, OutputSink};
use crate::error::StepError;

/// Env var naming the file a step writes its output variables to.
pub const OUTPUT_FILE_ENV: &str = "STEP_OUTPUT_FILE";
/// Env var carrying comma separated test globs.
pub const TEST_GLOBS_ENV: &str = "STEP_TEST_GLOBS";
/// Env var carrying the packages a legacy test step targets.
pub const TEST_PACKAGES_ENV: &str = "STEP_TEST_PACKAGES";

const SELECTION_FULL_RUN: &str = "FULL_RUN";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to prepare step workspace: {0}")]
    Prepare(#[from] std::io::Error),
    #[error("unsupported build tool: {0}")]
    UnsupportedBuildTool(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<DispatchError> for StepError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Engine(EngineError::Canceled) => StepError::Canceled,
            other => StepError::Engine(other.to_string()),
        }
    }
}

/// Outcome of one dispatched run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    /// `None` when the process never reached a terminal state.
    pub state: Option<ProcessState>,
    pub outputs: HashMap<String, String>,
    pub artifact: Vec<u8>,
    pub output_v2: Vec<OutputV2>,
    pub optimization_state: String,
    pub telemetry: Option<TelemetryData>,
    pub error: Option<StepError>,
}

impl RunResult {
    fn failed(err: DispatchError) -> Self {
        Self {
            error: Some(err.into()),
            ..Default::default()
        }
    }
}

/// What the engine should run plus what to collect afterwards.
#[derive(Debug)]
struct Prepared {
    exec: ExecSpec,
    output_vars: Vec<String>,
    output_file: PathBuf,
    artifact_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    engine: Arc<dyn Engine>,
    work_dir: PathBuf,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn Engine>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            work_dir: work_dir.into(),
        }
    }

    /// Run `req` to completion, routing on its kind.
    pub async fn run(
        &self,
        req: &StepRequest,
        output: Arc<dyn OutputSink>,
        ti: Option<&TiConfig>,
        cancel: CancellationToken,
    ) -> RunResult {
        debug!(step_id = %req.id, kind = req.kind.as_str(), "dispatching step");
        match req.kind {
            StepKind::Run => self.run_plain(req, output, cancel).await,
            StepKind::RunTestsV2 => self.run_tests_v2(req, output, ti, cancel).await,
            StepKind::RunTestStep => self.run_test_step(req, output, ti, cancel).await,
        }
    }

    async fn run_plain(
        &self,
        req: &StepRequest,
        output: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> RunResult {
        let run = &req.run;
        let prepared = match self.prepare(
            req,
            run.command.clone(),
            run.entrypoint.clone(),
            run.envs.clone(),
            run.working_dir.as_deref(),
            &run.output_vars,
        ) {
            Ok(mut prepared) => {
                prepared.artifact_file = run.artifact_file_path.as_ref().map(|path| {
                    resolve(run.working_dir.as_deref(), path)
                });
                prepared
            }
            Err(err) => return RunResult::failed(err),
        };

        self.execute(prepared, output, cancel).await
    }

    async fn run_tests_v2(
        &self,
        req: &StepRequest,
        output: Arc<dyn OutputSink>,
        ti: Option<&TiConfig>,
        cancel: CancellationToken,
    ) -> RunResult {
        let cfg = &req.run_tests_v2;
        let mut envs = cfg.envs.clone();
        envs.insert(TEST_GLOBS_ENV.to_string(), cfg.test_globs.join(","));
        let intelligence = ti.filter(|_| !cfg.intelligence_disabled);
        if let Some(ti) = intelligence {
            envs.extend(ti.env_vars());
        }

        let prepared = match self.prepare(
            req,
            cfg.command.clone(),
            Vec::new(),
            envs,
            cfg.working_dir.as_deref(),
            &cfg.output_vars,
        ) {
            Ok(prepared) => prepared,
            Err(err) => return RunResult::failed(err),
        };

        let started = Instant::now();
        let mut result = self.execute(prepared, output, cancel).await;
        result.optimization_state = optimization_state(intelligence.is_some()).to_string();
        result.telemetry = Some(TelemetryData {
            selection: SELECTION_FULL_RUN.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            ..Default::default()
        });
        result
    }

    async fn run_test_step(
        &self,
        req: &StepRequest,
        output: Arc<dyn OutputSink>,
        ti: Option<&TiConfig>,
        cancel: CancellationToken,
    ) -> RunResult {
        let cfg = &req.run_test;
        let command = match test_command(&cfg.build_tool, &cfg.args) {
            Ok(command) => command,
            Err(err) => return RunResult::failed(err),
        };

        let mut script = vec!["set -e".to_string()];
        script.extend(non_blank(&cfg.pre_command));
        script.extend(non_blank(&command));
        script.extend(non_blank(&cfg.post_command));

        let mut envs = cfg.envs.clone();
        if !cfg.test_globs.is_empty() {
            envs.insert(TEST_GLOBS_ENV.to_string(), cfg.test_globs.clone());
        }
        if !cfg.packages.is_empty() {
            envs.insert(TEST_PACKAGES_ENV.to_string(), cfg.packages.clone());
        }
        let intelligence = ti.filter(|_| cfg.run_only_selected_tests);
        if let Some(ti) = intelligence {
            envs.extend(ti.env_vars());
        }

        let prepared = match self.prepare(
            req,
            script,
            Vec::new(),
            envs,
            cfg.working_dir.as_deref(),
            &cfg.output_vars,
        ) {
            Ok(prepared) => prepared,
            Err(err) => return RunResult::failed(err),
        };

        let started = Instant::now();
        let mut result = self.execute(prepared, output, cancel).await;
        result.optimization_state = optimization_state(intelligence.is_some()).to_string();
        result.telemetry = Some(TelemetryData {
            language: cfg.language.clone(),
            build_tool: cfg.build_tool.clone(),
            selection: SELECTION_FULL_RUN.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        result
    }

    fn prepare(
        &self,
        req: &StepRequest,
        command: Vec<String>,
        entrypoint: Vec<String>,
        mut envs: HashMap<String, String>,
        working_dir: Option<&str>,
        output_vars: &[String],
    ) -> Result<Prepared, DispatchError> {
        std::fs::create_dir_all(&self.work_dir)?;
        let output_file = self.work_dir.join(format!("{}-output.env", file_stem(&req.id)));
        match std::fs::remove_file(&output_file) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        envs.insert(
            OUTPUT_FILE_ENV.to_string(),
            output_file.to_string_lossy().into_owned(),
        );

        Ok(Prepared {
            exec: ExecSpec {
                step_id: req.id.clone(),
                command,
                entrypoint,
                envs,
                working_dir: working_dir.filter(|d| !d.is_empty()).map(PathBuf::from),
            },
            output_vars: output_vars.to_vec(),
            output_file,
            artifact_file: None,
        })
    }

    async fn execute(
        &self,
        prepared: Prepared,
        output: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> RunResult {
        let step_id = prepared.exec.step_id.clone();
        let state = match self.engine.run(&prepared.exec, output, cancel).await {
            Ok(state) => state,
            Err(err) => {
                debug!(step_id = %step_id, error = %err, "engine run failed");
                remove_quietly(&prepared.output_file);
                return RunResult::failed(err.into());
            }
        };

        let mut result = RunResult {
            state: Some(state),
            ..Default::default()
        };

        if state.exited && state.exit_code == 0 {
            if !prepared.output_vars.is_empty() {
                let (outputs, output_v2) =
                    read_outputs(&prepared.output_file, &prepared.output_vars);
                result.outputs = outputs;
                result.output_v2 = output_v2;
            }
            if let Some(path) = &prepared.artifact_file {
                match std::fs::read(path) {
                    Ok(bytes) => result.artifact = bytes,
                    Err(err) => {
                        warn!(step_id = %step_id, path = %path.display(), error = %err, "artifact file not readable");
                    }
                }
            }
        }

        remove_quietly(&prepared.output_file);
        result
    }
}

fn optimization_state(intelligence: bool) -> &'static str {
    if intelligence {
        OptimizationState::Unoptimized.as_str()
    } else {
        OptimizationState::Disabled.as_str()
    }
}

/// Command line for a legacy test step's build tool.
fn test_command(build_tool: &str, args: &str) -> Result<String, DispatchError> {
    let tool = match build_tool.to_ascii_lowercase().as_str() {
        "" => return Ok(args.to_string()),
        "maven" => "mvn",
        "gradle" => "gradle",
        "bazel" => "bazel test",
        "sbt" => "sbt test",
        "dotnet" => "dotnet test",
        "nunitconsole" => "nunit3-console",
        "go" => "go test",
        "pytest" => "pytest",
        "unittest" => "python3 -m unittest",
        "rspec" => "bundle exec rspec",
        other => return Err(DispatchError::UnsupportedBuildTool(other.to_string())),
    };
    Ok(if args.is_empty() {
        tool.to_string()
    } else {
        format!("{tool} {args}")
    })
}

fn non_blank(command: &str) -> Option<String> {
    let trimmed = command.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Parse `KEY=VALUE` lines and keep the requested variables, in request order.
fn read_outputs(path: &Path, wanted: &[String]) -> (HashMap<String, String>, Vec<OutputV2>) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return (HashMap::new(), Vec::new());
    };

    let mut found = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((key, value)) = line.split_once('=') {
            found.insert(key.trim().to_string(), value.to_string());
        }
    }

    let mut outputs = HashMap::new();
    let mut output_v2 = Vec::new();
    for key in wanted {
        if let Some(value) = found.get(key) {
            outputs.insert(key.clone(), value.clone());
            output_v2.push(OutputV2 {
                key: key.clone(),
                value: value.clone(),
                output_type: OutputType::String,
            });
        }
    }
    (outputs, output_v2)
}

fn resolve(working_dir: Option<&str>, path: &str) -> PathBuf {
    let path = Path::new(path);
    match working_dir {
        Some(dir) if path.is_relative() && !dir.is_empty() => Path::new(dir).join(path),
        _ => path.to_path_buf(),
    }
}

/// Step identifiers are caller supplied; keep them safe as file names.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn remove_quietly(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %err, "failed to remove output file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::CaptureSink;
    use crate::engine::ProcessEngine;
    use step_core::{RunConfig, RunTestConfig, RunTestsV2Config};
    use tempfile::TempDir;

    fn dispatcher() -> (Dispatcher, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine: Arc<dyn Engine> = Arc::new(ProcessEngine::new());
        (Dispatcher::new(engine, dir.path().join("work")), dir)
    }

    fn run_request(id: &str, command: &[&str]) -> StepRequest {
        StepRequest {
            id: id.to_string(),
            run: RunConfig {
                command: command.iter().map(ToString::to_string).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn plain_run_collects_requested_outputs() {
        let (dispatcher, _dir) = dispatcher();
        let mut req = run_request(
            "step/one",
            &[
                "echo building",
                "echo VERSION=1.2.3 >> \"$STEP_OUTPUT_FILE\"",
                "echo IGNORED=x >> \"$STEP_OUTPUT_FILE\"",
            ],
        );
        req.run.output_vars = vec!["VERSION".to_string(), "MISSING".to_string()];
        let sink = Arc::new(CaptureSink::default());

        let result = dispatcher
            .run(&req, sink.clone(), None, CancellationToken::new())
            .await;

        assert_eq!(result.state, Some(ProcessState::exited(0)));
        assert!(result.error.is_none());
        assert_eq!(result.outputs.len(), 1);
        assert_eq!(result.outputs["VERSION"], "1.2.3");
        assert_eq!(result.output_v2.len(), 1);
        assert_eq!(result.output_v2[0].output_type, OutputType::String);
        assert!(result.optimization_state.is_empty());
        assert!(result.telemetry.is_none());
        assert!(sink.contents().contains("building"));
    }

    #[tokio::test]
    async fn failed_run_skips_outputs() {
        let (dispatcher, _dir) = dispatcher();
        let mut req = run_request("s", &["echo A=1 >> \"$STEP_OUTPUT_FILE\"", "exit 4"]);
        req.run.output_vars = vec!["A".to_string()];

        let result = dispatcher
            .run(&req, Arc::new(CaptureSink::default()), None, CancellationToken::new())
            .await;

        assert_eq!(result.state, Some(ProcessState::exited(4)));
        assert!(result.outputs.is_empty());
    }

    #[tokio::test]
    async fn artifact_file_is_read_relative_to_working_dir() {
        let (dispatcher, dir) = dispatcher();
        let mut req = run_request("s", &["printf 'artifact-bytes' > report.json"]);
        req.run.working_dir = Some(dir.path().to_string_lossy().into_owned());
        req.run.artifact_file_path = Some("report.json".to_string());

        let result = dispatcher
            .run(&req, Arc::new(CaptureSink::default()), None, CancellationToken::new())
            .await;

        assert_eq!(result.artifact, b"artifact-bytes");
    }

    #[tokio::test]
    async fn empty_command_is_an_engine_error() {
        let (dispatcher, _dir) = dispatcher();
        let req = run_request("s", &[]);

        let result = dispatcher
            .run(&req, Arc::new(CaptureSink::default()), None, CancellationToken::new())
            .await;

        assert!(result.state.is_none());
        assert!(matches!(result.error, Some(StepError::Engine(_))));
    }

    #[tokio::test]
    async fn cancellation_maps_to_canceled() {
        let (dispatcher, _dir) = dispatcher();
        let req = run_request("s", &["exec sleep 30"]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = dispatcher
            .run(&req, Arc::new(CaptureSink::default()), None, cancel)
            .await;

        assert_eq!(result.error, Some(StepError::Canceled));
    }

    #[tokio::test]
    async fn tests_v2_exports_globs_and_reports_disabled_without_ti() {
        let (dispatcher, _dir) = dispatcher();
        let req = StepRequest {
            id: "tests".to_string(),
            kind: StepKind::RunTestsV2,
            run_tests_v2: RunTestsV2Config {
                command: vec!["echo \"globs=$STEP_TEST_GLOBS\"".to_string()],
                test_globs: vec!["a/**".to_string(), "b/*.py".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let sink = Arc::new(CaptureSink::default());

        let result = dispatcher
            .run(&req, sink.clone(), None, CancellationToken::new())
            .await;

        assert_eq!(result.optimization_state, "DISABLED");
        assert_eq!(result.telemetry.unwrap().selection, "FULL_RUN");
        assert!(sink.contents().contains("globs=a/**,b/*.py"));
    }

    #[tokio::test]
    async fn tests_v2_with_ti_exports_config() {
        let (dispatcher, _dir) = dispatcher();
        let req = StepRequest {
            id: "tests".to_string(),
            kind: StepKind::RunTestsV2,
            run_tests_v2: RunTestsV2Config {
                command: vec!["echo \"repo=$STEP_TI_REPO\"".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let ti = TiConfig {
            repo: "org/app".to_string(),
            ..Default::default()
        };
        let sink = Arc::new(CaptureSink::default());

        let result = dispatcher
            .run(&req, sink.clone(), Some(&ti), CancellationToken::new())
            .await;

        assert_eq!(result.optimization_state, "UNOPTIMIZED");
        assert!(sink.contents().contains("repo=org/app"));
    }

    #[tokio::test]
    async fn legacy_test_step_runs_pre_and_post_commands() {
        let (dispatcher, _dir) = dispatcher();
        let req = StepRequest {
            id: "legacy".to_string(),
            kind: StepKind::RunTestStep,
            run_test: RunTestConfig {
                pre_command: "echo pre".to_string(),
                args: "echo running tests".to_string(),
                post_command: "echo post".to_string(),
                language: "python".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let sink = Arc::new(CaptureSink::default());

        let result = dispatcher
            .run(&req, sink.clone(), None, CancellationToken::new())
            .await;

        assert_eq!(result.state, Some(ProcessState::exited(0)));
        assert_eq!(sink.contents(), "pre\nrunning tests\npost\n");
        let telemetry = result.telemetry.unwrap();
        assert_eq!(telemetry.language, "python");
        assert_eq!(result.optimization_state, "DISABLED");
    }

    #[tokio::test]
    async fn legacy_test_step_rejects_unknown_build_tool() {
        let (dispatcher, _dir) = dispatcher();
        let req = StepRequest {
            id: "legacy".to_string(),
            kind: StepKind::RunTestStep,
            run_test: RunTestConfig {
                build_tool: "ant".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        let result = dispatcher
            .run(&req, Arc::new(CaptureSink::default()), None, CancellationToken::new())
            .await;

        assert_eq!(
            result.error,
            Some(StepError::Engine("unsupported build tool: ant".to_string()))
        );
    }

    #[test]
    fn test_command_per_build_tool() {
        assert_eq!(test_command("maven", "test -q").unwrap(), "mvn test -q");
        assert_eq!(test_command("Go", "./...").unwrap(), "go test ./...");
        assert_eq!(test_command("pytest", "").unwrap(), "pytest");
        assert_eq!(test_command("", "make test").unwrap(), "make test");
    }

    #[test]
    fn file_stem_replaces_unsafe_characters() {
        assert_eq!(file_stem("stage/step 1"), "stage_step_1");
    }

    #[test]
    fn read_outputs_keeps_request_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.env");
        std::fs::write(&path, "# comment\nB=2\nexport A=x=y\n").unwrap();

        let (outputs, v2) = read_outputs(&path, &["A".to_string(), "B".to_string()]);
        assert_eq!(outputs["A"], "x=y");
        assert_eq!(v2[0].key, "A");
        assert_eq!(v2[1].key, "B");
    }
}
