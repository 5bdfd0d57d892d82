use buildpipe_core::DefinitionError;
use thiserror::Error;

/// Errors that prevent a run from starting.
///
/// Failures of the steps themselves are not errors: they are reported through
/// `PipelineResult::Failure`.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Invalid pipeline: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
