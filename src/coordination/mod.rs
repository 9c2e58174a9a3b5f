//! Workflow coordination
//!
//! - `engine`: the orchestrator, one validated transition per call
//! - `driver`: the scheduling loop that calls it for every active task,
//!   bounds retries of ambiguous outcomes and supports per-task abort

pub mod driver;
pub mod engine;

pub use driver::TaskDriver;
pub use engine::Orchestrator;
