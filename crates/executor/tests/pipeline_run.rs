#![cfg(unix)]

use buildpipe_core::{DefinitionError, FailureCause, Pipeline, PipelineResult};
use events::{Event, EventBus};
use executor::{CancelHandle, ExecutorConfig, ExecutorError, PipelineExecutor};
use serde_json::{json, Value};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A shell step that records its name in `${target_dir}/steps.log` before running `script`.
fn step(name: &str, script: &str, args: &[&str]) -> Value {
    let mut arguments = vec![
        "-c".to_string(),
        format!("echo {} >> \"$0\"; {}", name, script),
        "${target_dir}/steps.log".to_string(),
    ];
    arguments.extend(args.iter().map(|a| a.to_string()));
    json!({ "command": "sh", "arguments": arguments })
}

fn compile() -> Value {
    step(
        "compile",
        "mkdir -p \"$(dirname \"$1\")\" && printf 'wasm' > \"$1\"",
        &["${artifact}"],
    )
}

fn shrink() -> Value {
    step("shrink", "printf '%s' -gc >> \"$1\"", &["${artifact}"])
}

fn optimize() -> Value {
    step(
        "optimize",
        "cp \"$1\" \"$1.opt\" && mv \"$1.opt\" \"$1\"",
        &["${artifact}"],
    )
}

fn to_text() -> Value {
    step(
        "toText",
        "printf '(module)' > \"$2\"",
        &["${artifact}", "${target_dir}/module.wat"],
    )
}

fn from_text() -> Value {
    step(
        "fromText",
        "cat \"$1\" >> \"$2\"",
        &["${target_dir}/module.wat", "${artifact}"],
    )
}

fn definition(steps: Vec<Value>) -> Pipeline {
    Pipeline::from_value(json!({
        "steps": steps,
        "artifact": "${target_dir}/wasm32-unknown-unknown/release/module.wasm",
    }))
    .unwrap()
}

fn wasm_pipeline() -> Pipeline {
    definition(vec![compile(), shrink(), optimize(), to_text(), from_text()])
}

fn invoked(target_dir: &Path) -> Vec<String> {
    std::fs::read_to_string(target_dir.join("steps.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_full_pipeline_produces_artifact() {
    let dir = TempDir::new().unwrap();
    let executor = PipelineExecutor::new(ExecutorConfig::new(dir.path()));

    let result = executor.run(&wasm_pipeline()).await.unwrap();

    let PipelineResult::Success {
        artifact_path,
        artifact_size,
        artifact_sha256,
        steps,
    } = result
    else {
        panic!("expected the pipeline to succeed");
    };

    let expected = dir
        .path()
        .join("target/wasm32-unknown-unknown/release/module.wasm");
    assert_eq!(artifact_path, expected);
    assert_eq!(std::fs::read(&expected).unwrap(), b"wasm-gc(module)");
    assert_eq!(artifact_size, 15);
    assert_eq!(artifact_sha256.len(), 64);
    assert_eq!(steps.len(), 5);
    assert!(steps.iter().all(|s| s.exit_code == Some(0)));
    assert_eq!(
        invoked(&dir.path().join("target")),
        vec!["compile", "shrink", "optimize", "toText", "fromText"]
    );
}

#[tokio::test]
async fn test_failing_step_stops_the_run() {
    let dir = TempDir::new().unwrap();
    let executor = PipelineExecutor::new(ExecutorConfig::new(dir.path()));
    let broken_to_text = step(
        "toText",
        "echo 'toText: unexpected section' >&2; exit 1",
        &[],
    );
    let pipeline = definition(vec![compile(), shrink(), optimize(), broken_to_text, from_text()]);

    let result = executor.run(&pipeline).await.unwrap();

    assert_eq!(result.failed_step_index(), Some(3));
    assert_eq!(
        result.cause(),
        Some(&FailureCause::NonZeroExit {
            command: "sh".to_string(),
            exit_code: Some(1),
        })
    );
    let failed = result.failed_step().unwrap();
    assert!(failed.stderr_lossy().contains("unexpected section"));
    assert_eq!(
        invoked(&dir.path().join("target")),
        vec!["compile", "shrink", "optimize", "toText"]
    );

    let report = result.to_report(4096);
    assert!(!report.success);
    assert_eq!(report.failed_step_index, Some(3));
    assert_eq!(report.steps.len(), 4);
}

#[tokio::test]
async fn test_unresolved_placeholder_spawns_nothing() {
    let dir = TempDir::new().unwrap();
    let executor = PipelineExecutor::new(ExecutorConfig::new(dir.path()));

    let err = Pipeline::from_value(json!({
        "steps": [compile(), step("convert", "true", &["${wat_file}"])],
        "artifact": "${target_dir}/out.wasm",
    }))
    .unwrap_err();
    assert_eq!(err.unresolved_token(), Some("wat_file"));

    // The same definition is accepted once the executor declares the variable.
    let executor = PipelineExecutor::new(
        executor
            .config()
            .clone()
            .with_var("wat_file", "${target_dir}/module.wat"),
    );
    let declared = executor.declared_symbols().unwrap();
    let pipeline = Pipeline::from_value_with(
        json!({
            "steps": [step("convert", "printf x > \"$1\"; printf y > \"$2\"", &["${wat_file}", "${artifact}"])],
            "artifact": "${target_dir}/out.wasm",
        }),
        &declared,
    )
    .unwrap();
    let result = executor.run(&pipeline).await.unwrap();
    assert!(result.is_success());
    assert!(dir.path().join("target/module.wat").is_file());

    // An executor without the variable refuses the pipeline before running anything.
    let strict = PipelineExecutor::new(ExecutorConfig::new(dir.path()).with_target_dir("other"));
    let err = strict.run(&pipeline).await.unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::Definition(DefinitionError::InvalidReference { .. })
    ));
    assert!(!dir.path().join("other").exists());
}

#[tokio::test]
async fn test_missing_command_is_spawn_failure() {
    let dir = TempDir::new().unwrap();
    let executor = PipelineExecutor::new(ExecutorConfig::new(dir.path()));
    let pipeline = definition(vec![
        compile(),
        json!({ "command": "buildpipe-no-such-tool-xyz", "arguments": ["${artifact}"] }),
        from_text(),
    ]);

    let result = executor.run(&pipeline).await.unwrap();

    assert_eq!(result.failed_step_index(), Some(1));
    let Some(FailureCause::Spawn { command, reason }) = result.cause() else {
        panic!("expected spawn failure, got {:?}", result.cause());
    };
    assert_eq!(command, "buildpipe-no-such-tool-xyz");
    assert!(reason.contains("not found"));
    assert_eq!(invoked(&dir.path().join("target")), vec!["compile"]);
}

#[tokio::test]
async fn test_empty_artifact_is_failure() {
    let dir = TempDir::new().unwrap();
    let executor = PipelineExecutor::new(ExecutorConfig::new(dir.path()));
    let truncate = step("truncate", ": > \"$1\"", &["${artifact}"]);
    let pipeline = definition(vec![compile(), truncate]);

    let result = executor.run(&pipeline).await.unwrap();

    assert_eq!(result.failed_step_index(), Some(1));
    let Some(FailureCause::ArtifactMissing { reason, .. }) = result.cause() else {
        panic!("expected artifact failure, got {:?}", result.cause());
    };
    assert_eq!(reason, "is empty");
}

#[tokio::test]
async fn test_hanging_step_times_out() {
    let dir = TempDir::new().unwrap();
    let executor = PipelineExecutor::new(
        ExecutorConfig::new(dir.path()).with_step_timeout(Duration::from_millis(300)),
    );
    let hang = step("hang", "exec sleep 30", &[]);
    let pipeline = definition(vec![compile(), hang, from_text()]);

    let started = Instant::now();
    let result = executor.run(&pipeline).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.failed_step_index(), Some(1));
    assert_eq!(
        result.cause(),
        Some(&FailureCause::Timeout { timeout_ms: 300 })
    );
    assert_eq!(invoked(&dir.path().join("target")), vec!["compile", "hang"]);
}

#[tokio::test]
async fn test_background_helper_does_not_hold_up_step() {
    let dir = TempDir::new().unwrap();
    let executor = PipelineExecutor::new(
        ExecutorConfig::new(dir.path()).with_step_timeout(Duration::from_secs(10)),
    );
    let daemonize = step(
        "daemonize",
        "printf built > \"$1\"; echo started; sleep 20 & exit 0",
        &["${artifact}"],
    );
    let pipeline = definition(vec![compile(), daemonize]);

    let started = Instant::now();
    let result = executor.run(&pipeline).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(result.is_success(), "unexpected failure: {:?}", result.cause());
    let steps = result.step_results();
    assert_eq!(steps[1].exit_code, Some(0));
    assert_eq!(steps[1].stdout_lossy(), "started\n");
}

#[tokio::test]
async fn test_cancel_stops_running_step() {
    let dir = TempDir::new().unwrap();
    let executor = PipelineExecutor::new(ExecutorConfig::new(dir.path()));
    let hang = step("hang", "exec sleep 30", &[]);
    let pipeline = definition(vec![compile(), hang, from_text()]);
    let cancel = CancelHandle::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = executor.run_with_cancel(&pipeline, &cancel).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.failed_step_index(), Some(1));
    assert_eq!(result.cause(), Some(&FailureCause::Cancelled));
    assert_eq!(invoked(&dir.path().join("target")), vec!["compile", "hang"]);
}

#[tokio::test]
async fn test_concurrent_runs_with_separate_target_dirs() {
    let dir = TempDir::new().unwrap();
    let pipeline = wasm_pipeline();
    let first = PipelineExecutor::new(ExecutorConfig::new(dir.path()).with_target_dir("a"));
    let second = PipelineExecutor::new(ExecutorConfig::new(dir.path()).with_target_dir("b"));

    let (a, b) = tokio::join!(first.run(&pipeline), second.run(&pipeline));

    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.is_success());
    assert!(b.is_success());
    assert_ne!(a.artifact_path(), b.artifact_path());
    assert_eq!(invoked(&dir.path().join("a")).len(), 5);
    assert_eq!(invoked(&dir.path().join("b")).len(), 5);
}

#[tokio::test]
async fn test_same_pipeline_runs_twice() {
    let dir = TempDir::new().unwrap();
    let executor = PipelineExecutor::new(ExecutorConfig::new(dir.path()));
    let pipeline = wasm_pipeline();

    let first = executor.run(&pipeline).await.unwrap();
    let second = executor.run(&pipeline).await.unwrap();

    assert!(first.is_success());
    assert!(second.is_success());
    assert_eq!(invoked(&dir.path().join("target")).len(), 10);
}

#[tokio::test]
async fn test_target_dir_env_is_exported() {
    let dir = TempDir::new().unwrap();
    let executor = PipelineExecutor::new(
        ExecutorConfig::new(dir.path()).with_target_dir_env("CARGO_TARGET_DIR"),
    );
    let pipeline = Pipeline::from_value(json!({
        "steps": [{
            "command": "sh",
            "arguments": ["-c", "printf '%s' \"$CARGO_TARGET_DIR\" > \"$1\"", "sh", "${artifact}"],
        }],
        "artifact": "${target_dir}/env.txt",
    }))
    .unwrap();

    let result = executor.run(&pipeline).await.unwrap();

    assert!(result.is_success());
    let written = std::fs::read_to_string(dir.path().join("target/env.txt")).unwrap();
    assert_eq!(Path::new(&written), dir.path().join("target"));
}

#[tokio::test]
async fn test_run_events_follow_progress() {
    let dir = TempDir::new().unwrap();
    let bus = EventBus::new();
    let mut all = bus.subscribe();
    let executor =
        PipelineExecutor::new(ExecutorConfig::new(dir.path())).with_event_bus(bus.clone());

    let result = executor.run(&wasm_pipeline()).await.unwrap();
    assert!(result.is_success());

    let first = all.recv().await.unwrap();
    let Event::RunStarted {
        run_id, step_count, ..
    } = first.event
    else {
        panic!("expected run.started first");
    };
    assert_eq!(step_count, 5);

    let mut started = 0;
    let mut verified = 0;
    let mut finished = None;
    while let Ok(envelope) = all.try_recv() {
        assert_eq!(envelope.event.run_id(), run_id);
        match envelope.event {
            Event::StepStarted { .. } => started += 1,
            Event::ArtifactVerified { step_index, .. } => {
                verified += 1;
                assert_eq!(step_index, 4);
            }
            Event::RunFinished { success, .. } => finished = Some(success),
            _ => {}
        }
    }
    assert_eq!(started, 5);
    assert_eq!(verified, 1);
    assert_eq!(finished, Some(true));
}
