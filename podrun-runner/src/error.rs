//! Run error taxonomy

use std::time::Duration;

use podrun_client::ClientError;
use podrun_core::{ManifestError, PodId, PodPhase};
use thiserror::Error;

/// Ways a run can fail
#[derive(Debug, Error)]
pub enum RunError {
    /// Missing or invalid command-line input or cluster settings
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Manifest unreadable, malformed or of the wrong kind
    #[error("failed to load manifest: {0}")]
    Load(#[from] ManifestError),

    /// A cluster request that the run depends on failed
    #[error("cluster request failed: {0}")]
    Gateway(#[from] ClientError),

    /// A live pod with the same identity exists
    #[error("cannot clean up pod {pod} in phase {phase}, manual cleanup is required")]
    UnsafeState { pod: PodId, phase: PodPhase },

    /// An infrastructure operation exceeded its deadline
    #[error("{operation} did not finish within {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The watch ended before delivering the pod's initial state
    #[error("watch for pod {pod} ended before it synchronized")]
    WatchClosed { pod: PodId },

    /// The pod did not reach a terminal phase before the run deadline
    #[error("pod did not finish within the run timeout of {timeout:?}")]
    RunTimeout { timeout: Duration },

    /// The pod was deleted before it reached a terminal phase
    #[error("pod {pod} was deleted before it finished (return code {code})")]
    PodVanished { pod: PodId, code: i32 },

    /// The pod finished unsuccessfully
    #[error("encountered non-zero return code from watching pod: {code}")]
    NonZeroReturnCode { code: i32 },
}

impl RunError {
    /// Return code the run ended with; -1 when no terminal phase was seen
    pub fn return_code(&self) -> i32 {
        match self {
            RunError::NonZeroReturnCode { code } | RunError::PodVanished { code, .. } => *code,
            _ => -1,
        }
    }
}
