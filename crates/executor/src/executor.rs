//! Sequential, fail-fast pipeline execution.
//!
//! A run moves through `Pending -> Running(0) -> .. -> Succeeded | Failed(i)`. Every step is one
//! child process; the first step that fails to spawn, exits with a rejected code, times out, is
//! cancelled or leaves the artifact missing ends the run.

use buildpipe_core::{
    ExecutionContext, FailureCause, Pipeline, PipelineResult, RunState, Step, StepResult,
    ARTIFACT, TARGET_DIR, WORKDIR,
};
use chrono::Utc;
use events::{Event, EventBus};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::CancelHandle;
use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, Result};
use crate::process::{Invocation, ProcessLauncher, ProcessOutcome, SystemLauncher};
use crate::state_machine::RunStateMachine;
use crate::toolchain::{self, CommandAvailability};

/// Per-run state. Never shared between runs.
struct RunTracker {
    run_id: Uuid,
    step_count: usize,
    state: RunState,
}

impl RunTracker {
    fn new(step_count: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            step_count,
            state: RunState::Pending,
        }
    }

    /// Move to the state that follows a successful current state.
    fn advance(&mut self) -> Result<RunState> {
        let next = RunStateMachine::next_state(&self.state, self.step_count).ok_or_else(|| {
            ExecutorError::InvalidTransition {
                from: self.state.to_string(),
                to: "a successor".to_string(),
            }
        })?;
        self.transition(next)?;
        Ok(next)
    }

    fn transition(&mut self, to: RunState) -> Result<()> {
        RunStateMachine::validate_transition(&self.state, &to, self.step_count)?;
        debug!(run_id = %self.run_id, from = %self.state, to = %to, "Run state transition");
        self.state = to;
        Ok(())
    }
}

/// Concrete locations for one run.
struct RunLayout {
    working_dir: PathBuf,
    target_dir: PathBuf,
    artifact_path: PathBuf,
    context: ExecutionContext,
}

pub struct PipelineExecutor {
    config: ExecutorConfig,
    launcher: Arc<dyn ProcessLauncher>,
    event_bus: Option<EventBus>,
}

impl PipelineExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            launcher: Arc::new(SystemLauncher::new()),
            event_bus: None,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Symbols a pipeline run by this executor may reference.
    pub fn declared_symbols(&self) -> Result<ExecutionContext> {
        self.config.declared_symbols()
    }

    /// Validate `pipeline` against this executor's symbols. Spawns nothing.
    pub fn validate(&self, pipeline: &Pipeline) -> Result<()> {
        pipeline.validate_with(&self.declared_symbols()?)?;
        Ok(())
    }

    /// The context a run would use, without touching the filesystem.
    pub fn execution_context(&self, pipeline: &Pipeline) -> Result<ExecutionContext> {
        Ok(self.layout(pipeline)?.context)
    }

    /// Check that every step's command resolves, without running anything.
    pub fn check_commands(&self, pipeline: &Pipeline) -> Result<Vec<CommandAvailability>> {
        self.validate(pipeline)?;
        let context = self.execution_context(pipeline)?;
        Ok(toolchain::check_commands(pipeline, &context))
    }

    pub async fn run(&self, pipeline: &Pipeline) -> Result<PipelineResult> {
        self.run_with_cancel(pipeline, &CancelHandle::new()).await
    }

    /// Run every step in order.
    ///
    /// `Err` means the run never started (invalid pipeline or configuration, unusable target
    /// directory). Once the first step is about to start, the outcome is always `Ok`.
    pub async fn run_with_cancel(
        &self,
        pipeline: &Pipeline,
        cancel: &CancelHandle,
    ) -> Result<PipelineResult> {
        self.validate(pipeline)?;
        let layout = self.layout(pipeline)?;
        let mut tracker = RunTracker::new(pipeline.len());

        tokio::fs::create_dir_all(&layout.target_dir).await?;

        info!(
            run_id = %tracker.run_id,
            steps = pipeline.len(),
            launcher = self.launcher.name(),
            working_dir = %layout.working_dir.display(),
            target_dir = %layout.target_dir.display(),
            artifact = %layout.artifact_path.display(),
            "Starting pipeline run"
        );
        self.emit(Event::RunStarted {
            run_id: tracker.run_id,
            step_count: pipeline.len(),
            artifact: layout.artifact_path.display().to_string(),
        });

        let mut completed: Vec<StepResult> = Vec::with_capacity(pipeline.len());

        for (index, step) in pipeline.steps().iter().enumerate() {
            tracker.advance()?;

            if cancel.is_cancelled() {
                return self.fail(&mut tracker, index, None, FailureCause::Cancelled, completed);
            }

            let invocation = self.invocation(index, step, &layout)?;
            info!(
                run_id = %tracker.run_id,
                step_index = index,
                command = %invocation.program,
                "Running step"
            );
            self.emit(Event::StepStarted {
                run_id: tracker.run_id,
                step_index: index,
                command: invocation.program.clone(),
            });

            let started_at = Utc::now();
            let started = Instant::now();
            let outcome = self.launcher.launch(&invocation, cancel).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let (step_result, cause) = interpret(step, &invocation, outcome, started_at, duration_ms);

            self.emit(Event::StepFinished {
                run_id: tracker.run_id,
                step_index: index,
                exit_code: step_result.exit_code,
                duration_ms,
                success: cause.is_none(),
            });

            if let Some(cause) = cause {
                return self.fail(&mut tracker, index, Some(step_result), cause, completed);
            }

            if pipeline.checks_artifact_after(index) {
                match inspect_artifact(&layout.artifact_path).await {
                    Ok(size) => {
                        debug!(
                            run_id = %tracker.run_id,
                            step_index = index,
                            size,
                            "Artifact present"
                        );
                        self.emit(Event::ArtifactVerified {
                            run_id: tracker.run_id,
                            step_index: index,
                            path: layout.artifact_path.display().to_string(),
                            size,
                        });
                    }
                    Err(reason) => {
                        let cause = FailureCause::ArtifactMissing {
                            path: layout.artifact_path.clone(),
                            reason,
                        };
                        return self.fail(&mut tracker, index, Some(step_result), cause, completed);
                    }
                }
            }

            debug!(
                run_id = %tracker.run_id,
                step_index = index,
                duration_ms,
                "Step completed"
            );
            completed.push(step_result);
        }

        let (artifact_size, artifact_sha256) = match digest_artifact(&layout.artifact_path).await {
            Ok(digest) => digest,
            Err(reason) => {
                let index = pipeline.last_index();
                let failed_step = completed.pop();
                let cause = FailureCause::ArtifactMissing {
                    path: layout.artifact_path.clone(),
                    reason,
                };
                return self.fail(&mut tracker, index, failed_step, cause, completed);
            }
        };

        tracker.advance()?;
        info!(
            run_id = %tracker.run_id,
            artifact = %layout.artifact_path.display(),
            size = artifact_size,
            sha256 = %artifact_sha256,
            "Pipeline run succeeded"
        );
        self.emit(Event::RunFinished {
            run_id: tracker.run_id,
            success: true,
            failed_step_index: None,
            cause: None,
        });

        Ok(PipelineResult::Success {
            artifact_path: layout.artifact_path,
            artifact_size,
            artifact_sha256,
            steps: completed,
        })
    }

    fn fail(
        &self,
        tracker: &mut RunTracker,
        index: usize,
        step_result: Option<StepResult>,
        cause: FailureCause,
        completed: Vec<StepResult>,
    ) -> Result<PipelineResult> {
        tracker.transition(RunState::Failed { step_index: index })?;

        match &cause {
            FailureCause::Cancelled => warn!(
                run_id = %tracker.run_id,
                step_index = index,
                "Pipeline run cancelled"
            ),
            _ => error!(
                run_id = %tracker.run_id,
                step_index = index,
                cause = %cause,
                stderr = %step_result
                    .as_ref()
                    .map(|step| step.stderr_excerpt(self.config.stderr_excerpt_bytes))
                    .unwrap_or_default(),
                "Pipeline run failed"
            ),
        }

        self.emit(Event::RunFinished {
            run_id: tracker.run_id,
            success: false,
            failed_step_index: Some(index),
            cause: Some(cause.to_string()),
        });

        Ok(PipelineResult::Failure {
            failed_step_index: index,
            step_result,
            cause,
            steps: completed,
        })
    }

    fn layout(&self, pipeline: &Pipeline) -> Result<RunLayout> {
        let working_dir = self.config.absolute_working_dir()?;
        let target_dir = self.config.resolved_target_dir(&working_dir);

        let base = ExecutionContext::new()
            .with(WORKDIR, working_dir.to_string_lossy())
            .with(TARGET_DIR, target_dir.to_string_lossy());

        // Variables see the directories but not each other, so their order is irrelevant.
        let mut context = base.clone();
        for (name, template) in &self.config.vars {
            context.insert(name.clone(), base.resolve(template)?);
        }

        let artifact_path = context.resolve_path(pipeline.artifact())?;
        context.insert(ARTIFACT, artifact_path.to_string_lossy());

        Ok(RunLayout {
            working_dir,
            target_dir,
            artifact_path,
            context,
        })
    }

    fn invocation(&self, index: usize, step: &Step, layout: &RunLayout) -> Result<Invocation> {
        let context = &layout.context;

        let command = context.resolve(step.command())?;
        let program = if command.contains('/') && Path::new(&command).is_relative() {
            layout.working_dir.join(&command).to_string_lossy().into_owned()
        } else {
            command
        };

        let args = step
            .arguments()
            .iter()
            .map(|arg| context.resolve(arg))
            .collect::<buildpipe_core::Result<Vec<_>>>()?;

        let mut env = BTreeMap::new();
        for (key, value) in &self.config.env {
            env.insert(key.clone(), context.resolve(value)?);
        }
        if let Some(name) = &self.config.target_dir_env {
            env.insert(name.clone(), layout.target_dir.to_string_lossy().into_owned());
        }
        for (key, value) in step.env() {
            env.insert(key.clone(), context.resolve(value)?);
        }

        Ok(Invocation {
            step_index: index,
            program,
            args,
            cwd: layout.working_dir.clone(),
            env,
            timeout: step.timeout().or(self.config.step_timeout),
        })
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event);
        }
    }
}

fn interpret(
    step: &Step,
    invocation: &Invocation,
    outcome: ProcessOutcome,
    started_at: chrono::DateTime<Utc>,
    duration_ms: u64,
) -> (StepResult, Option<FailureCause>) {
    let mut result = StepResult {
        step_index: invocation.step_index,
        command: invocation.program.clone(),
        arguments: invocation.args.clone(),
        exit_code: None,
        pid: None,
        stdout: Vec::new(),
        stderr: Vec::new(),
        started_at,
        duration_ms,
    };

    let cause = match outcome {
        ProcessOutcome::Exited {
            exit_code,
            pid,
            stdout,
            stderr,
        } => {
            result.exit_code = exit_code;
            result.pid = pid;
            result.stdout = stdout;
            result.stderr = stderr;
            match exit_code {
                Some(code) if step.accepts(code) => None,
                _ => Some(FailureCause::NonZeroExit {
                    command: invocation.program.clone(),
                    exit_code,
                }),
            }
        }
        ProcessOutcome::SpawnFailed { reason } => Some(FailureCause::Spawn {
            command: invocation.program.clone(),
            reason,
        }),
        ProcessOutcome::WaitFailed { pid, reason } => {
            result.pid = pid;
            Some(FailureCause::WaitFailed {
                command: invocation.program.clone(),
                reason,
            })
        }
        ProcessOutcome::TimedOut { pid } => {
            result.pid = pid;
            Some(FailureCause::Timeout {
                timeout_ms: invocation
                    .timeout
                    .map(|t| t.as_millis() as u64)
                    .unwrap_or(duration_ms),
            })
        }
        ProcessOutcome::Cancelled { pid } => {
            result.pid = pid;
            Some(FailureCause::Cancelled)
        }
    };

    (result, cause)
}

/// Size of the artifact, or why it does not count as produced.
async fn inspect_artifact(path: &Path) -> std::result::Result<u64, String> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if !meta.is_file() => Err("is not a regular file".to_string()),
        Ok(meta) if meta.len() == 0 => Err("is empty".to_string()),
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err("does not exist".to_string()),
        Err(e) => Err(format!("cannot be inspected: {}", e)),
    }
}

async fn digest_artifact(path: &Path) -> std::result::Result<(u64, String), String> {
    inspect_artifact(path).await?;
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("cannot be read: {}", e))?;
    if bytes.is_empty() {
        return Err("is empty".to_string());
    }
    Ok((bytes.len() as u64, hex::encode(Sha256::digest(&bytes))))
}
