//! Run orchestration
//!
//! [`RunOrchestrator`] sequences a run: pre-flight cleanup, submission,
//! observation of the pod's lifecycle, log capture and teardown.

mod runner;
mod watcher;

pub use runner::RunOrchestrator;
