pub mod cancel;
pub mod config;
pub mod error;
pub mod executor;
pub mod process;
pub mod state_machine;
pub mod toolchain;

pub use cancel::CancelHandle;
pub use config::ExecutorConfig;
pub use error::{ExecutorError, Result};
pub use executor::PipelineExecutor;
pub use process::{Invocation, ProcessLauncher, ProcessOutcome, SystemLauncher};
pub use state_machine::RunStateMachine;
pub use toolchain::{check_commands, CommandAvailability};
