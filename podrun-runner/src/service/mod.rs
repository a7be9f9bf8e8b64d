//! Service layer
//!
//! Services the orchestrator delegates to while a run is in progress:
//! capturing pod output and tearing the pod down afterwards. Both are
//! best-effort; failures are logged and never fail the run.

mod log_stream;
mod teardown;

pub use log_stream::{LogStreamRegistry, OutputFactory, OutputSink, stdout_output};
pub use teardown::Teardown;
