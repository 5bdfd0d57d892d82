use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::step::{Step, StepDefinition};
use crate::error::{DefinitionError, Result};
use crate::path::{ExecutionContext, ARTIFACT, WELL_KNOWN_SYMBOLS};

/// An ordered list of steps and the artifact they build.
///
/// A `Pipeline` is validated when constructed and never mutated afterwards, so the same
/// value can be handed to any number of runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct Pipeline {
    steps: Vec<Step>,
    artifact: String,
}

impl Pipeline {
    pub fn new(steps: Vec<Step>, artifact: impl Into<String>) -> Result<Self> {
        Self::with_symbols(steps, artifact, &default_symbols())
    }

    /// Like [`Pipeline::new`], validating against a caller-declared set of symbols.
    pub fn with_symbols(
        steps: Vec<Step>,
        artifact: impl Into<String>,
        declared: &ExecutionContext,
    ) -> Result<Self> {
        let pipeline = Self {
            steps,
            artifact: artifact.into(),
        };
        pipeline.validate_with(declared)?;
        Ok(pipeline)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_json_with(json, &default_symbols())
    }

    pub fn from_json_with(json: &str, declared: &ExecutionContext) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| DefinitionError::MalformedDefinition(e.to_string()))?;
        Self::from_value_with(value, declared)
    }

    pub fn from_slice_with(bytes: &[u8], declared: &ExecutionContext) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| DefinitionError::MalformedDefinition(e.to_string()))?;
        Self::from_value_with(value, declared)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Self::from_value_with(value, &default_symbols())
    }

    /// Build a pipeline from a parsed definition document.
    ///
    /// Unknown fields are ignored at every level.
    pub fn from_value_with(value: Value, declared: &ExecutionContext) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            DefinitionError::MalformedDefinition("definition must be a JSON object".to_string())
        })?;

        let raw_steps = object
            .get("steps")
            .ok_or_else(|| {
                DefinitionError::MalformedDefinition("missing required field `steps`".to_string())
            })?
            .as_array()
            .ok_or_else(|| {
                DefinitionError::MalformedDefinition("`steps` must be an array".to_string())
            })?;

        let artifact = object
            .get("artifact")
            .ok_or_else(|| {
                DefinitionError::MalformedDefinition(
                    "missing required field `artifact`".to_string(),
                )
            })?
            .as_str()
            .ok_or_else(|| {
                DefinitionError::MalformedDefinition("`artifact` must be a string".to_string())
            })?;

        let steps = raw_steps
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                let definition: StepDefinition = serde_json::from_value(raw.clone())
                    .map_err(|e| DefinitionError::MalformedStep {
                        index,
                        reason: e.to_string(),
                    })?;
                Step::from_definition(definition).map_err(|e| e.at_step(index))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::with_symbols(steps, artifact, declared)
    }

    /// Validate against the well-known symbols only.
    pub fn validate(&self) -> Result<()> {
        self.validate_with(&default_symbols())
    }

    /// Check that the pipeline is runnable with the symbols declared in `declared`.
    ///
    /// Pure: nothing is spawned and the filesystem is not touched.
    pub fn validate_with(&self, declared: &ExecutionContext) -> Result<()> {
        if self.steps.is_empty() {
            return Err(DefinitionError::Validation(
                "pipeline must contain at least one step".to_string(),
            ));
        }

        if self.artifact.trim().is_empty() {
            return Err(DefinitionError::Validation(
                "artifact path must not be empty".to_string(),
            ));
        }

        // The artifact is bound from its own resolution, so it cannot refer to itself.
        let mut artifact_scope = ExecutionContext::new();
        for name in declared.names().filter(|name| *name != ARTIFACT) {
            artifact_scope.insert(name, "");
        }
        artifact_scope
            .resolve(&self.artifact)
            .map_err(|e| e.in_location("artifact"))?;

        let mut step_scope = declared.clone();
        if !step_scope.contains(ARTIFACT) {
            step_scope.insert(ARTIFACT, "");
        }
        for (index, step) in self.steps.iter().enumerate() {
            for (location, template) in step.templates() {
                step_scope
                    .resolve(template)
                    .map_err(|e| e.in_location(format!("step {} {}", index, location)))?;
            }
        }

        Ok(())
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    pub fn last_index(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    /// Whether the artifact must exist and be non-empty right after step `index`.
    pub fn checks_artifact_after(&self, index: usize) -> bool {
        index == self.last_index() || self.steps.get(index).is_some_and(Step::produces_artifact)
    }
}

fn default_symbols() -> ExecutionContext {
    ExecutionContext::declared(WELL_KNOWN_SYMBOLS)
}

impl TryFrom<Value> for Pipeline {
    type Error = DefinitionError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}
