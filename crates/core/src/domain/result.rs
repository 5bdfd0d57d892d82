use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Outcome of a single step's process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub command: String,
    /// Arguments after placeholder resolution.
    pub arguments: Vec<String>,
    /// `None` when the process never ran or was terminated by a signal.
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// The last `max_bytes` of stderr, where toolchains usually print the actual error.
    pub fn stderr_excerpt(&self, max_bytes: usize) -> String {
        let start = self.stderr.len().saturating_sub(max_bytes);
        String::from_utf8_lossy(&self.stderr[start..]).into_owned()
    }
}

/// Why a run stopped before producing its artifact.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    #[error("Failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("`{command}` exited with {}", describe_exit(.exit_code))]
    NonZeroExit {
        command: String,
        exit_code: Option<i32>,
    },

    #[error("Lost track of `{command}`: {reason}")]
    WaitFailed { command: String, reason: String },

    #[error("Step timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Artifact {} {reason}", .path.display())]
    ArtifactMissing { path: PathBuf, reason: String },
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn",
            Self::WaitFailed { .. } => "wait_failed",
            Self::NonZeroExit { .. } => "non_zero_exit",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::ArtifactMissing { .. } => "artifact_missing",
        }
    }
}

/// Terminal value of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineResult {
    Success {
        artifact_path: PathBuf,
        artifact_size: u64,
        /// Hex-encoded SHA-256 of the artifact.
        artifact_sha256: String,
        steps: Vec<StepResult>,
    },
    Failure {
        failed_step_index: usize,
        /// `None` when the run stopped before the step's process was started.
        step_result: Option<StepResult>,
        cause: FailureCause,
        /// Steps that completed before the failure.
        steps: Vec<StepResult>,
    },
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        match self {
            Self::Success { artifact_path, .. } => Some(artifact_path),
            Self::Failure { .. } => None,
        }
    }

    pub fn failed_step_index(&self) -> Option<usize> {
        match self {
            Self::Failure {
                failed_step_index, ..
            } => Some(*failed_step_index),
            Self::Success { .. } => None,
        }
    }

    pub fn cause(&self) -> Option<&FailureCause> {
        match self {
            Self::Failure { cause, .. } => Some(cause),
            Self::Success { .. } => None,
        }
    }

    pub fn failed_step(&self) -> Option<&StepResult> {
        match self {
            Self::Failure { step_result, .. } => step_result.as_ref(),
            Self::Success { .. } => None,
        }
    }

    /// Results of every step that ran, the failing one included.
    pub fn step_results(&self) -> Vec<&StepResult> {
        match self {
            Self::Success { steps, .. } => steps.iter().collect(),
            Self::Failure {
                steps, step_result, ..
            } => steps.iter().chain(step_result.as_ref()).collect(),
        }
    }

    pub fn to_report(&self, stderr_excerpt_bytes: usize) -> RunReport {
        let steps = self
            .step_results()
            .into_iter()
            .map(|step| StepSummary {
                step_index: step.step_index,
                command: step.command.clone(),
                exit_code: step.exit_code,
                duration_ms: step.duration_ms,
            })
            .collect();

        match self {
            Self::Success {
                artifact_path,
                artifact_size,
                artifact_sha256,
                ..
            } => RunReport {
                success: true,
                artifact_path: Some(artifact_path.clone()),
                artifact_size: Some(*artifact_size),
                artifact_sha256: Some(artifact_sha256.clone()),
                failed_step_index: None,
                cause: None,
                stderr_excerpt: None,
                steps,
            },
            Self::Failure {
                failed_step_index,
                step_result,
                cause,
                ..
            } => RunReport {
                success: false,
                artifact_path: None,
                artifact_size: None,
                artifact_sha256: None,
                failed_step_index: Some(*failed_step_index),
                cause: Some(cause.to_string()),
                stderr_excerpt: step_result
                    .as_ref()
                    .map(|step| step.stderr_excerpt(stderr_excerpt_bytes))
                    .filter(|excerpt| !excerpt.is_empty()),
                steps,
            },
        }
    }
}

/// Flat, serializable view of a [`PipelineResult`] for reporters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_excerpt: Option<String>,
    pub steps: Vec<StepSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_index: usize,
    pub command: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}
