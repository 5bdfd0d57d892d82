use thiserror::Error;

/// Errors raised while loading or validating a pipeline definition.
///
/// None of these are produced after a process has been spawned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("Malformed definition: {0}")]
    MalformedDefinition(String),

    #[error("Malformed step {index}: {reason}")]
    MalformedStep { index: usize, reason: String },

    #[error("Unresolved placeholder: ${{{token}}}")]
    UnresolvedPath { token: String },

    #[error("Unterminated placeholder in {template:?}")]
    UnterminatedPlaceholder { template: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid reference in {location}: {source}")]
    InvalidReference {
        location: String,
        #[source]
        source: Box<DefinitionError>,
    },
}

impl DefinitionError {
    pub(crate) fn malformed_step(reason: impl Into<String>) -> Self {
        Self::MalformedStep {
            index: 0,
            reason: reason.into(),
        }
    }

    /// Re-attribute a step construction error to its position in the pipeline.
    pub(crate) fn at_step(self, index: usize) -> Self {
        match self {
            Self::MalformedStep { reason, .. } => Self::MalformedStep { index, reason },
            other => other,
        }
    }

    pub(crate) fn in_location(self, location: impl Into<String>) -> Self {
        Self::InvalidReference {
            location: location.into(),
            source: Box::new(self),
        }
    }

    /// The placeholder name behind an unresolved reference, however deeply wrapped.
    pub fn unresolved_token(&self) -> Option<&str> {
        match self {
            Self::UnresolvedPath { token } => Some(token),
            Self::InvalidReference { source, .. } => source.unresolved_token(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DefinitionError>;
