use buildpipe_core::{Pipeline, RunReport};
use colored::Colorize;
use events::Event;
use executor::CommandAvailability;

/// One line per event, printed while the run progresses.
pub fn print_progress(event: &Event) {
    match event {
        Event::RunStarted {
            step_count,
            artifact,
            ..
        } => {
            println!(
                "{} {} steps -> {}",
                "Running".bold(),
                step_count,
                artifact
            );
        }
        Event::StepStarted {
            step_index,
            command,
            ..
        } => {
            println!("  {} [{}] {}", "→".cyan(), step_index, command);
        }
        Event::StepFinished {
            step_index,
            exit_code,
            duration_ms,
            success,
            ..
        } => {
            let status = match exit_code {
                Some(code) => format!("exit {}", code),
                None => "no exit status".to_string(),
            };
            let mark = if *success { "✓".green() } else { "✗".red() };
            println!(
                "  {} [{}] {} ({} ms)",
                mark,
                step_index,
                status.dimmed(),
                duration_ms
            );
        }
        Event::ArtifactVerified { .. } | Event::RunFinished { .. } => {}
    }
}

pub fn print_report(report: &RunReport) {
    println!();
    if report.success {
        println!("{}", "Pipeline succeeded".green().bold());
        if let Some(path) = &report.artifact_path {
            println!("  Artifact: {}", path.display());
        }
        if let Some(size) = report.artifact_size {
            println!("  Size:     {} bytes", size);
        }
        if let Some(digest) = &report.artifact_sha256 {
            println!("  SHA-256:  {}", digest);
        }
        return;
    }

    match report.failed_step_index {
        Some(index) => println!(
            "{} {}",
            "Pipeline failed at step".red().bold(),
            index.to_string().red().bold()
        ),
        None => println!("{}", "Pipeline failed".red().bold()),
    }
    if let Some(cause) = &report.cause {
        println!("  {}", cause);
    }
    if let Some(excerpt) = &report.stderr_excerpt {
        println!();
        println!("{}", "stderr:".dimmed());
        for line in excerpt.lines() {
            println!("  {}", line);
        }
    }
}

pub fn print_availability(pipeline: &Pipeline, report: &[CommandAvailability]) {
    println!(
        "{} {} steps -> {}",
        "Pipeline".bold(),
        pipeline.len(),
        pipeline.artifact()
    );
    for (step, availability) in pipeline.steps().iter().zip(report) {
        match &availability.resolved {
            Some(path) => println!(
                "  {} [{}] {} {}",
                "✓".green(),
                availability.step_index,
                step.display_line(),
                format!("({})", path.display()).dimmed()
            ),
            None => println!(
                "  {} [{}] {} {}",
                "✗".red(),
                availability.step_index,
                step.display_line(),
                "(command not found)".red()
            ),
        }
    }
}
