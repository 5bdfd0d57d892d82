//! Run events for buildpipe
//!
//! The executor publishes progress here; reporters and tests subscribe.

mod bus;
mod types;

pub use bus::{EventBus, RunSubscription};
pub use types::*;
