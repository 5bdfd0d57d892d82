use serde::{Deserialize, Serialize};

/// Lifecycle of a single pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Pending,
    Running {
        step_index: usize,
    },
    Succeeded,
    Failed {
        step_index: usize,
    },
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running { .. } => "running",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }

    pub fn step_index(&self) -> Option<usize> {
        match self {
            Self::Running { step_index } | Self::Failed { step_index } => Some(*step_index),
            Self::Pending | Self::Succeeded => None,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.step_index() {
            Some(index) => write!(f, "{}({})", self.as_str(), index),
            None => f.write_str(self.as_str()),
        }
    }
}
