//! Event types emitted while a pipeline runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Everything a run reports about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Validation passed and the first step is about to start
    #[serde(rename = "run.started")]
    RunStarted {
        run_id: Uuid,
        step_count: usize,
        artifact: String,
    },

    /// A step's process is being spawned
    #[serde(rename = "step.started")]
    StepStarted {
        run_id: Uuid,
        step_index: usize,
        command: String,
    },

    /// A step's process ended, whatever the outcome
    #[serde(rename = "step.finished")]
    StepFinished {
        run_id: Uuid,
        step_index: usize,
        exit_code: Option<i32>,
        duration_ms: u64,
        success: bool,
    },

    /// The artifact passed its existence check
    #[serde(rename = "artifact.verified")]
    ArtifactVerified {
        run_id: Uuid,
        step_index: usize,
        path: String,
        size: u64,
    },

    /// The run reached a terminal state
    #[serde(rename = "run.finished")]
    RunFinished {
        run_id: Uuid,
        success: bool,
        failed_step_index: Option<usize>,
        cause: Option<String>,
    },
}

impl Event {
    pub fn run_id(&self) -> Uuid {
        match self {
            Event::RunStarted { run_id, .. }
            | Event::StepStarted { run_id, .. }
            | Event::StepFinished { run_id, .. }
            | Event::ArtifactVerified { run_id, .. }
            | Event::RunFinished { run_id, .. } => *run_id,
        }
    }

    pub fn step_index(&self) -> Option<usize> {
        match self {
            Event::StepStarted { step_index, .. }
            | Event::StepFinished { step_index, .. }
            | Event::ArtifactVerified { step_index, .. } => Some(*step_index),
            Event::RunFinished {
                failed_step_index, ..
            } => *failed_step_index,
            Event::RunStarted { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::RunFinished { .. })
    }
}
