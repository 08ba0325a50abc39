//! Core types for the step execution daemon.
//!
//! Requests, terminal results, and the payloads exchanged with callers and
//! with the remote log service.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exit code reported when a step failed for a reason other than its own
/// process exit status.
pub const INFRA_ERROR_EXIT_CODE: i32 = 255;

// --- Enumerations ---

/// Which execution strategy the dispatcher uses for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Plain command execution.
    #[default]
    Run,
    /// Structured test execution.
    RunTestsV2,
    /// Legacy test execution.
    RunTestStep,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::RunTestsV2 => "run_tests_v2",
            Self::RunTestStep => "run_test_step",
        }
    }
}

/// Lifecycle of one step identifier. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    NotStarted,
    Running,
    Complete,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
        }
    }
}

/// Test-selection outcome token returned with test steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptimizationState {
    /// A subset of tests was selected.
    Optimized,
    /// The full suite ran.
    Unoptimized,
    /// Test intelligence was off for this step.
    Disabled,
}

impl OptimizationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Optimized => "OPTIMIZED",
            Self::Unoptimized => "UNOPTIMIZED",
            Self::Disabled => "DISABLED",
        }
    }
}

/// Type tag carried by structured outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    #[default]
    String,
    Secret,
}

// --- Step request ---

/// Parameters for a plain `Run` step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Shell script lines. Joined with newlines and run through the entrypoint.
    pub command: Vec<String>,
    /// Entrypoint; defaults to `sh -c` when empty.
    pub entrypoint: Vec<String>,
    pub envs: HashMap<String, String>,
    pub working_dir: Option<String>,
    /// Variables to read back from the step's output file.
    pub output_vars: Vec<String>,
    /// File whose contents become the step artifact.
    pub artifact_file_path: Option<String>,
}

/// Parameters for a legacy `RunTestStep` step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunTestConfig {
    pub args: String,
    pub pre_command: String,
    pub post_command: String,
    pub language: String,
    pub build_tool: String,
    pub packages: String,
    pub run_only_selected_tests: bool,
    pub test_globs: String,
    pub envs: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub output_vars: Vec<String>,
}

/// Parameters for a structured `RunTestsV2` step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunTestsV2Config {
    pub command: Vec<String>,
    pub test_globs: Vec<String>,
    pub intelligence_disabled: bool,
    pub envs: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub output_vars: Vec<String>,
}

/// Immutable input to a step run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepRequest {
    /// Caller-supplied identifier, unique within the process lifetime.
    pub id: String,
    pub name: String,
    pub kind: StepKind,
    /// Timeout in seconds; zero or negative means no timeout.
    pub timeout: i64,
    /// Daemon semantics: the run outlives the start request.
    pub detach: bool,
    /// Key under which the remote log stream is opened.
    pub log_key: String,
    /// Selects the legacy execution path that writes into the local log buffer.
    pub log_drone: bool,
    pub run: RunConfig,
    pub run_test: RunTestConfig,
    pub run_tests_v2: RunTestsV2Config,
}

impl StepRequest {
    /// Timeout as a duration, or `None` when unbounded.
    pub fn timeout_duration(&self) -> Option<std::time::Duration> {
        u64::try_from(self.timeout)
            .ok()
            .filter(|secs| *secs > 0)
            .map(std::time::Duration::from_secs)
    }
}

/// Log buffering options passed through to the remote sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub trim_newline_suffix: bool,
}

/// Test intelligence settings. Passed through to test steps untouched apart
/// from being exported into the step environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiConfig {
    pub url: String,
    pub token: String,
    pub account_id: String,
    pub org_id: String,
    pub project_id: String,
    pub pipeline_id: String,
    pub build_id: String,
    pub stage_id: String,
    pub repo: String,
    pub sha: String,
    pub source_branch: String,
    pub target_branch: String,
    pub commit_link: String,
}

impl TiConfig {
    /// Environment variables exported to test processes.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        [
            ("STEP_TI_URL", &self.url),
            ("STEP_TI_TOKEN", &self.token),
            ("STEP_TI_ACCOUNT_ID", &self.account_id),
            ("STEP_TI_ORG_ID", &self.org_id),
            ("STEP_TI_PROJECT_ID", &self.project_id),
            ("STEP_TI_PIPELINE_ID", &self.pipeline_id),
            ("STEP_TI_BUILD_ID", &self.build_id),
            ("STEP_TI_STAGE_ID", &self.stage_id),
            ("STEP_TI_REPO", &self.repo),
            ("STEP_TI_SHA", &self.sha),
            ("STEP_TI_SOURCE_BRANCH", &self.source_branch),
            ("STEP_TI_TARGET_BRANCH", &self.target_branch),
            ("STEP_TI_COMMIT_LINK", &self.commit_link),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
    }
}

// --- Results ---

/// Terminal state of the step process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    pub exited: bool,
    pub exit_code: i32,
    pub oom_killed: bool,
}

impl ProcessState {
    /// State reported for detached steps that are still running.
    pub fn detached() -> Self {
        Self {
            exited: false,
            exit_code: 0,
            oom_killed: false,
        }
    }

    pub fn exited(exit_code: i32) -> Self {
        Self {
            exited: true,
            exit_code,
            oom_killed: false,
        }
    }
}

/// Structured output captured from a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputV2 {
    pub key: String,
    pub value: String,
    #[serde(rename = "type", default)]
    pub output_type: OutputType,
}

/// Telemetry gathered while running test steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryData {
    pub language: String,
    pub build_tool: String,
    /// `FULL_RUN` or `SELECTIVE`.
    pub selection: String,
    pub duration_ms: u64,
}

/// Response returned by a status poll. Always well formed, even on failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollStepResponse {
    pub exited: bool,
    pub exit_code: i32,
    pub oom_killed: bool,
    pub outputs: HashMap<String, String>,
    pub artifact: Vec<u8>,
    pub output_v2: Vec<OutputV2>,
    pub optimization_state: String,
    pub telemetry: Option<TelemetryData>,
    /// Empty when the step succeeded.
    pub error: String,
}

/// One line sent to the remote log service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: String,
    /// Zero-based line number within the stream.
    #[serde(rename = "pos")]
    pub number: usize,
    #[serde(rename = "out")]
    pub message: String,
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
    /// Seconds since the stream was opened.
    #[serde(rename = "duration")]
    pub elapsed: i64,
}
