use buildpipe_core::{ExecutionContext, Pipeline};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Whether a step's command can be found, checked without running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandAvailability {
    pub step_index: usize,
    pub command: String,
    pub resolved: Option<PathBuf>,
}

impl CommandAvailability {
    pub fn is_available(&self) -> bool {
        self.resolved.is_some()
    }
}

/// Look up every step's command the way it will be spawned.
///
/// Bare names are searched on `PATH`; anything containing a separator is taken as a path,
/// relative ones anchored at `${workdir}`.
pub fn check_commands(pipeline: &Pipeline, context: &ExecutionContext) -> Vec<CommandAvailability> {
    let cwd = context
        .workdir()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let search_path = std::env::var_os("PATH");

    pipeline
        .steps()
        .iter()
        .enumerate()
        .map(|(step_index, step)| {
            let resolved = context.resolve(step.command()).ok().and_then(|command| {
                if command.contains(std::path::MAIN_SEPARATOR) || command.contains('/') {
                    let path = context.resolve_path(&command).ok()?;
                    path.is_file().then_some(path)
                } else {
                    which::which_in(&command, search_path.as_ref(), &cwd).ok()
                }
            });

            CommandAvailability {
                step_index,
                command: step.command().to_string(),
                resolved,
            }
        })
        .collect()
}
