pub mod agent;
pub mod broadcast;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod git;
pub mod io;
pub mod lock;
pub mod paths;
pub mod pipeline;
pub mod prompt;
pub mod queue;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use coordinator::{Coordinator, CoordinatorSettings};
pub use error::{GitPilotError, Result};
