mod config;
mod report;

use anyhow::{Context, Result};
use buildpipe_core::Pipeline;
use clap::{Parser, Subcommand};
use events::EventBus;
use executor::{CancelHandle, PipelineExecutor};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{BuildpipeConfig, Overrides, CONFIG_FILE, PROJECT_DIR};

#[derive(Parser)]
#[command(name = "buildpipe")]
#[command(about = "Run a pipeline of toolchain commands that builds one artifact", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline definition
    Run {
        definition: PathBuf,

        /// Directory steps run in [default: the definition's directory]
        #[arg(long)]
        workdir: Option<PathBuf>,

        #[arg(long)]
        target_dir: Option<PathBuf>,

        /// Per-step timeout in seconds, 0 to disable
        #[arg(long)]
        timeout: Option<u64>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a definition and check that its commands are installed
    Validate {
        definition: PathBuf,

        #[arg(long)]
        workdir: Option<PathBuf>,
    },
    /// Write a default configuration to .buildpipe/config.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            definition,
            workdir,
            target_dir,
            timeout,
            json,
        } => {
            let overrides = Overrides {
                target_dir,
                step_timeout_secs: timeout,
            };
            run(&definition, workdir, &overrides, json).await
        }
        Commands::Validate {
            definition,
            workdir,
        } => validate(&definition, workdir).await,
        Commands::Init => init_project().await,
    }
}

async fn load_executor(
    definition: &Path,
    workdir: Option<PathBuf>,
    overrides: &Overrides,
) -> Result<(PipelineExecutor, Pipeline, BuildpipeConfig)> {
    let cwd = std::env::current_dir()?;
    let (config, source) = BuildpipeConfig::load(&cwd).await?;
    match &source {
        Some(path) => tracing::debug!(path = %path.display(), "Loaded configuration"),
        None => tracing::debug!("No configuration file, using defaults"),
    }

    let working_dir = workdir.unwrap_or_else(|| default_workdir(definition));
    let executor = PipelineExecutor::new(config.to_executor_config(&working_dir, overrides));

    let bytes = tokio::fs::read(definition)
        .await
        .with_context(|| format!("Failed to read {}", definition.display()))?;
    let pipeline = Pipeline::from_slice_with(&bytes, &executor.declared_symbols()?)
        .with_context(|| format!("Invalid pipeline definition {}", definition.display()))?;

    Ok((executor, pipeline, config))
}

fn default_workdir(definition: &Path) -> PathBuf {
    match definition.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

async fn run(
    definition: &Path,
    workdir: Option<PathBuf>,
    overrides: &Overrides,
    json: bool,
) -> Result<ExitCode> {
    let (executor, pipeline, config) = load_executor(definition, workdir, overrides).await?;

    let cancel = CancelHandle::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            trigger.cancel();
        }
    });

    let bus = EventBus::new();
    let progress = (!json).then(|| {
        let mut run = bus.subscribe_next_run();
        tokio::spawn(async move {
            while let Some(event) = run.recv().await {
                report::print_progress(&event);
            }
        })
    });
    let executor = executor.with_event_bus(bus);

    let outcome = executor.run_with_cancel(&pipeline, &cancel).await;
    drop(executor);
    if let Some(progress) = progress {
        let _ = progress.await;
    }

    let result = outcome.context("Pipeline run could not start")?;
    let report = result.to_report(config.executor.stderr_excerpt_bytes);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report::print_report(&report);
    }

    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn validate(definition: &Path, workdir: Option<PathBuf>) -> Result<ExitCode> {
    let (executor, pipeline, _) =
        load_executor(definition, workdir, &Overrides::default()).await?;

    let availability = executor.check_commands(&pipeline)?;
    report::print_availability(&pipeline, &availability);

    let missing = availability.iter().filter(|a| !a.is_available()).count();
    if missing > 0 {
        println!();
        println!("{} command(s) not found", missing);
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn init_project() -> Result<ExitCode> {
    let cwd = std::env::current_dir()?;
    let project_dir = cwd.join(PROJECT_DIR);
    let config_path = project_dir.join(CONFIG_FILE);

    if config_path.exists() {
        println!("Already initialized at {}", config_path.display());
        return Ok(ExitCode::SUCCESS);
    }

    tokio::fs::create_dir_all(&project_dir).await?;
    let content = toml::to_string_pretty(&BuildpipeConfig::default())?;
    tokio::fs::write(&config_path, content)
        .await
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("Created {}/{}", PROJECT_DIR, CONFIG_FILE);
    Ok(ExitCode::SUCCESS)
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "buildpipe=debug,executor=debug"
    } else {
        "buildpipe=info,executor=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
