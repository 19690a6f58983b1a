pub mod context;
pub mod executor;
pub mod runlog;
pub mod types;

pub use context::RunContext;
pub use executor::{EngineSettings, WorkflowEngine};
