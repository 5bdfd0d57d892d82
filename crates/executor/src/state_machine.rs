use buildpipe_core::RunState;

use crate::error::{ExecutorError, Result};

/// Legal transitions of a run over a pipeline of `step_count` steps.
pub struct RunStateMachine;

impl RunStateMachine {
    pub fn validate_transition(from: &RunState, to: &RunState, step_count: usize) -> Result<()> {
        if Self::allowed_transitions(from, step_count).contains(to) {
            Ok(())
        } else {
            Err(ExecutorError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    fn allowed_transitions(from: &RunState, step_count: usize) -> Vec<RunState> {
        match *from {
            RunState::Pending if step_count > 0 => vec![RunState::Running { step_index: 0 }],
            RunState::Pending => vec![],
            RunState::Running { step_index } => {
                let mut allowed = vec![RunState::Failed { step_index }];
                if step_index + 1 < step_count {
                    allowed.push(RunState::Running {
                        step_index: step_index + 1,
                    });
                } else {
                    allowed.push(RunState::Succeeded);
                }
                allowed
            }
            RunState::Succeeded | RunState::Failed { .. } => vec![],
        }
    }

    pub fn can_transition(from: &RunState, to: &RunState, step_count: usize) -> bool {
        Self::validate_transition(from, to, step_count).is_ok()
    }

    /// State after the current one completes successfully.
    pub fn next_state(current: &RunState, step_count: usize) -> Option<RunState> {
        match *current {
            RunState::Pending if step_count > 0 => Some(RunState::Running { step_index: 0 }),
            RunState::Running { step_index } if step_index + 1 < step_count => {
                Some(RunState::Running {
                    step_index: step_index + 1,
                })
            }
            RunState::Running { .. } => Some(RunState::Succeeded),
            _ => None,
        }
    }
}
