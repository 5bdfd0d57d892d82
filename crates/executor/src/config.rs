use buildpipe_core::{ExecutionContext, WELL_KNOWN_SYMBOLS};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ExecutorError, Result};

const DEFAULT_STDERR_EXCERPT_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Directory steps run in; bound to `${workdir}`.
    pub working_dir: PathBuf,
    /// Shared target directory, relative to `working_dir` unless absolute; bound to `${target_dir}`.
    pub target_dir: PathBuf,
    /// Default per-step timeout. Steps may override it.
    pub step_timeout: Option<Duration>,
    /// Environment variable that receives the target directory, e.g. `CARGO_TARGET_DIR`.
    pub target_dir_env: Option<String>,
    /// Extra environment for every step. Values may contain placeholders.
    pub env: BTreeMap<String, String>,
    /// Extra `${name}` symbols. Values may reference `${workdir}` and `${target_dir}`.
    pub vars: BTreeMap<String, String>,
    pub stderr_excerpt_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            target_dir: PathBuf::from("target"),
            step_timeout: None,
            target_dir_env: None,
            env: BTreeMap::new(),
            vars: BTreeMap::new(),
            stderr_excerpt_bytes: DEFAULT_STDERR_EXCERPT_BYTES,
        }
    }
}

impl ExecutorConfig {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_target_dir(mut self, target_dir: impl Into<PathBuf>) -> Self {
        self.target_dir = target_dir.into();
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn with_target_dir_env(mut self, name: impl Into<String>) -> Self {
        self.target_dir_env = Some(name.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn with_stderr_excerpt_bytes(mut self, bytes: usize) -> Self {
        self.stderr_excerpt_bytes = bytes;
        self
    }

    /// Working directory made absolute against the current process directory.
    pub fn absolute_working_dir(&self) -> Result<PathBuf> {
        if self.working_dir.is_absolute() {
            Ok(self.working_dir.clone())
        } else {
            Ok(std::env::current_dir()?.join(&self.working_dir))
        }
    }

    pub fn resolved_target_dir(&self, working_dir: &Path) -> PathBuf {
        if self.target_dir.is_absolute() {
            self.target_dir.clone()
        } else {
            working_dir.join(&self.target_dir)
        }
    }

    /// Every symbol a pipeline may reference under this configuration, with empty values.
    pub fn declared_symbols(&self) -> Result<ExecutionContext> {
        if let Some(name) = self
            .vars
            .keys()
            .find(|name| WELL_KNOWN_SYMBOLS.contains(&name.as_str()))
        {
            return Err(ExecutorError::Config(format!(
                "variable `{}` shadows a built-in symbol",
                name
            )));
        }

        Ok(ExecutionContext::declared(
            WELL_KNOWN_SYMBOLS
                .iter()
                .map(|name| name.to_string())
                .chain(self.vars.keys().cloned()),
        ))
    }
}
