use anyhow::{Context, Result};
use executor::ExecutorConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PROJECT_DIR: &str = ".buildpipe";
pub const CONFIG_FILE: &str = "config.toml";
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 600;
const DEFAULT_TARGET_DIR_ENV: &str = "CARGO_TARGET_DIR";
const DEFAULT_STDERR_EXCERPT_BYTES: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildpipeConfig {
    pub executor: ExecutorSection,
    /// Extra environment for every step.
    pub env: BTreeMap<String, String>,
    /// Extra `${name}` symbols available to definitions.
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub target_dir: PathBuf,
    /// 0 disables the timeout.
    pub step_timeout_secs: u64,
    /// Empty disables the export.
    pub target_dir_env: String,
    pub stderr_excerpt_bytes: usize,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            target_dir: PathBuf::from("target"),
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            target_dir_env: DEFAULT_TARGET_DIR_ENV.to_string(),
            stderr_excerpt_bytes: DEFAULT_STDERR_EXCERPT_BYTES,
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub target_dir: Option<PathBuf>,
    pub step_timeout_secs: Option<u64>,
}

impl BuildpipeConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid configuration")
    }

    /// Load the project config under `cwd`, then the user config, then defaults.
    ///
    /// Returns the path the configuration came from, if any.
    pub async fn load(cwd: &Path) -> Result<(Self, Option<PathBuf>)> {
        for path in Self::candidates(cwd) {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let config = Self::parse(&content)
                    .with_context(|| format!("Failed to load {}", path.display()))?;
                return Ok((config, Some(path)));
            }
        }
        Ok((Self::default(), None))
    }

    fn candidates(cwd: &Path) -> Vec<PathBuf> {
        let mut paths = vec![cwd.join(PROJECT_DIR).join(CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("buildpipe").join(CONFIG_FILE));
        }
        paths
    }

    pub fn to_executor_config(&self, working_dir: &Path, overrides: &Overrides) -> ExecutorConfig {
        let target_dir = overrides
            .target_dir
            .clone()
            .unwrap_or_else(|| self.executor.target_dir.clone());
        let timeout_secs = overrides
            .step_timeout_secs
            .unwrap_or(self.executor.step_timeout_secs);

        let mut config = ExecutorConfig::new(working_dir)
            .with_target_dir(target_dir)
            .with_stderr_excerpt_bytes(self.executor.stderr_excerpt_bytes);
        if timeout_secs > 0 {
            config = config.with_step_timeout(Duration::from_secs(timeout_secs));
        }
        if !self.executor.target_dir_env.is_empty() {
            config = config.with_target_dir_env(self.executor.target_dir_env.clone());
        }
        for (key, value) in &self.env {
            config = config.with_env(key.clone(), value.clone());
        }
        for (name, value) in &self.vars {
            config = config.with_var(name.clone(), value.clone());
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = BuildpipeConfig::parse("").unwrap();
        assert_eq!(config, BuildpipeConfig::default());
        assert_eq!(config.executor.step_timeout_secs, 600);
        assert_eq!(config.executor.target_dir_env, "CARGO_TARGET_DIR");
    }

    #[test]
    fn test_partial_file() {
        let config = BuildpipeConfig::parse(
            r#"
            [executor]
            target_dir = "/tmp/shared"
            step_timeout_secs = 0

            [env]
            RUSTFLAGS = "-C opt-level=z"

            [vars]
            wat = "${target_dir}/module.wat"
            "#,
        )
        .unwrap();

        assert_eq!(config.executor.target_dir, PathBuf::from("/tmp/shared"));
        assert_eq!(config.executor.step_timeout_secs, 0);
        assert_eq!(config.executor.stderr_excerpt_bytes, 4096);
        assert_eq!(config.env.get("RUSTFLAGS").unwrap(), "-C opt-level=z");
        assert_eq!(config.vars.get("wat").unwrap(), "${target_dir}/module.wat");
    }

    #[test]
    fn test_invalid_file_is_error() {
        assert!(BuildpipeConfig::parse("[executor]\nstep_timeout_secs = \"soon\"").is_err());
    }

    #[test]
    fn test_to_executor_config() {
        let mut config = BuildpipeConfig::default();
        config.env.insert("A".to_string(), "1".to_string());

        let executor = config.to_executor_config(Path::new("/src/zome"), &Overrides::default());

        assert_eq!(executor.working_dir, PathBuf::from("/src/zome"));
        assert_eq!(executor.target_dir, PathBuf::from("target"));
        assert_eq!(executor.step_timeout, Some(Duration::from_secs(600)));
        assert_eq!(executor.target_dir_env.as_deref(), Some("CARGO_TARGET_DIR"));
        assert_eq!(executor.env.get("A").unwrap(), "1");
    }

    #[test]
    fn test_overrides_win() {
        let mut config = BuildpipeConfig::default();
        config.executor.target_dir_env = String::new();

        let overrides = Overrides {
            target_dir: Some(PathBuf::from("out")),
            step_timeout_secs: Some(0),
        };
        let executor = config.to_executor_config(Path::new("/src"), &overrides);

        assert_eq!(executor.target_dir, PathBuf::from("out"));
        assert!(executor.step_timeout.is_none());
        assert!(executor.target_dir_env.is_none());
    }

    #[tokio::test]
    async fn test_load_project_config() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join(PROJECT_DIR);
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(
            project.join(CONFIG_FILE),
            "[executor]\nstderr_excerpt_bytes = 128\n",
        )
        .unwrap();

        let (config, source) = BuildpipeConfig::load(dir.path()).await.unwrap();

        assert_eq!(config.executor.stderr_excerpt_bytes, 128);
        assert_eq!(source, Some(project.join(CONFIG_FILE)));
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let rendered = toml::to_string_pretty(&BuildpipeConfig::default()).unwrap();
        assert!(rendered.contains("[executor]"));
        assert_eq!(
            BuildpipeConfig::parse(&rendered).unwrap(),
            BuildpipeConfig::default()
        );
    }
}
