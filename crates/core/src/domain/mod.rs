pub mod pipeline;
pub mod result;
pub mod run_state;
pub mod step;

pub use pipeline::Pipeline;
pub use result::{FailureCause, PipelineResult, RunReport, StepResult, StepSummary};
pub use run_state::RunState;
pub use step::{Step, StepDefinition};
