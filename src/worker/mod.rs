//! Render execution.
//!
//! - [`ProcessRunner`] / [`RenderProcess`]: the boundary to the external
//!   render engine. [`EngineRunner`] is the real implementation, spawning
//!   the engine with `tokio::process`; tests substitute scripted runners.
//! - [`JobExecutor`]: drives one process to a [`RunOutcome`], streaming
//!   output and honouring cancellation.
//!
//! The scheduler owns exactly one executor task and feeds it one job at a
//! time, so renders never compete for the machine.

pub mod executor;
pub mod runner;

pub use executor::{JobExecutor, RunOutcome};
pub use runner::{EngineRunner, ProcessRunner, RenderMode, RenderProcess};
