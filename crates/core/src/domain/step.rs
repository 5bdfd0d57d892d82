use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{DefinitionError, Result};

fn default_accepted_exit_codes() -> Vec<i32> {
    vec![0]
}

fn is_default_exit_codes(codes: &[i32]) -> bool {
    codes == [0]
}

/// Wire shape of a step, before its invariants are checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(
        default = "default_accepted_exit_codes",
        skip_serializing_if = "is_default_exit_codes"
    )]
    pub accepted_exit_codes: Vec<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub produces_artifact: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Millisecond form of the timeout; mutually exclusive with `timeout_secs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// One external command of a pipeline.
///
/// Steps are validated on construction and immutable afterwards; the builder-style
/// `with_*` methods consume and return a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StepDefinition", into = "StepDefinition")]
pub struct Step {
    command: String,
    arguments: Vec<String>,
    accepted_exit_codes: Vec<i32>,
    env: BTreeMap<String, String>,
    produces_artifact: bool,
    timeout: Option<Duration>,
}

impl Step {
    pub fn new<I, S>(command: impl Into<String>, arguments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_definition(StepDefinition {
            command: command.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
            accepted_exit_codes: default_accepted_exit_codes(),
            env: BTreeMap::new(),
            produces_artifact: false,
            timeout_secs: None,
            timeout_ms: None,
        })
    }

    pub fn from_definition(definition: StepDefinition) -> Result<Self> {
        if definition.command.trim().is_empty() {
            return Err(DefinitionError::malformed_step("command must not be empty"));
        }
        if definition.accepted_exit_codes.is_empty() {
            return Err(DefinitionError::malformed_step(
                "accepted_exit_codes must list at least one code",
            ));
        }
        let timeout = match (definition.timeout_secs, definition.timeout_ms) {
            (Some(_), Some(_)) => {
                return Err(DefinitionError::malformed_step(
                    "timeout_secs and timeout_ms are mutually exclusive",
                ))
            }
            (Some(0), None) | (None, Some(0)) => {
                return Err(DefinitionError::malformed_step(
                    "timeout must be greater than zero",
                ))
            }
            (Some(secs), None) => Some(Duration::from_secs(secs)),
            (None, Some(ms)) => Some(Duration::from_millis(ms)),
            (None, None) => None,
        };
        if let Some(key) = definition
            .env
            .keys()
            .find(|key| key.is_empty() || key.contains('='))
        {
            return Err(DefinitionError::malformed_step(format!(
                "invalid environment variable name {:?}",
                key
            )));
        }

        Ok(Self {
            command: definition.command,
            arguments: definition.arguments,
            accepted_exit_codes: definition.accepted_exit_codes,
            env: definition.env,
            produces_artifact: definition.produces_artifact,
            timeout,
        })
    }

    pub fn with_accepted_exit_codes(self, codes: Vec<i32>) -> Result<Self> {
        let mut definition = StepDefinition::from(self);
        definition.accepted_exit_codes = codes;
        Self::from_definition(definition)
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Mark this step as writing the pipeline artifact, so it is checked right after the step.
    pub fn producing_artifact(mut self) -> Self {
        self.produces_artifact = true;
        self
    }

    /// Millisecond precision; anything shorter is raised to one millisecond.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let millis = timeout.as_millis().clamp(1, u64::MAX as u128) as u64;
        self.timeout = Some(Duration::from_millis(millis));
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn accepted_exit_codes(&self) -> &[i32] {
        &self.accepted_exit_codes
    }

    pub fn accepts(&self, exit_code: i32) -> bool {
        self.accepted_exit_codes.contains(&exit_code)
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn produces_artifact(&self) -> bool {
        self.produces_artifact
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Every templated string of the step paired with a human-readable location.
    pub fn templates(&self) -> Vec<(String, &str)> {
        let mut templates = vec![("command".to_string(), self.command.as_str())];
        templates.extend(
            self.arguments
                .iter()
                .enumerate()
                .map(|(i, arg)| (format!("argument {}", i), arg.as_str())),
        );
        templates.extend(
            self.env
                .iter()
                .map(|(key, value)| (format!("env {}", key), value.as_str())),
        );
        templates
    }

    /// `command arg1 arg2`, for logs.
    pub fn display_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.arguments.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl TryFrom<StepDefinition> for Step {
    type Error = DefinitionError;

    fn try_from(definition: StepDefinition) -> Result<Self> {
        Self::from_definition(definition)
    }
}

impl From<Step> for StepDefinition {
    fn from(step: Step) -> Self {
        let (timeout_secs, timeout_ms) = match step.timeout {
            Some(timeout) if timeout.subsec_millis() == 0 => (Some(timeout.as_secs()), None),
            Some(timeout) => (None, Some(timeout.as_millis() as u64)),
            None => (None, None),
        };
        Self {
            command: step.command,
            arguments: step.arguments,
            accepted_exit_codes: step.accepted_exit_codes,
            env: step.env,
            produces_artifact: step.produces_artifact,
            timeout_secs,
            timeout_ms,
        }
    }
}
