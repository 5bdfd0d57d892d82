//! Domain model for build pipelines: steps, pipelines, symbolic paths and run results.
//!
//! Nothing in this crate performs I/O; running a pipeline is the `executor` crate's job.

pub mod domain;
pub mod error;
pub mod path;

pub use domain::{
    FailureCause, Pipeline, PipelineResult, RunReport, RunState, Step, StepDefinition, StepResult,
    StepSummary,
};
pub use error::{DefinitionError, Result};
pub use path::{resolve, ExecutionContext, ARTIFACT, TARGET_DIR, WELL_KNOWN_SYMBOLS, WORKDIR};
