//! Lifecycle event types

use serde::{Deserialize, Serialize};

use super::pod::PodPhase;

/// A phase observation produced by the watcher
///
/// Transient: consumed by the reconciliation loop and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub phase: PodPhase,
    pub observed_at: chrono::DateTime<chrono::Utc>,
}

impl PhaseEvent {
    /// Creates an event observed right now
    pub fn now(phase: PodPhase) -> Self {
        Self {
            phase,
            observed_at: chrono::Utc::now(),
        }
    }
}

/// Return code of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReturnCode {
    /// No terminal phase was observed
    #[default]
    Unset,
    Success,
    Failure,
}

impl ReturnCode {
    /// Return code for a terminal phase, `None` for phases that are not final
    pub fn for_phase(phase: PodPhase) -> Option<Self> {
        match phase {
            PodPhase::Succeeded => Some(ReturnCode::Success),
            PodPhase::Failed => Some(ReturnCode::Failure),
            _ => None,
        }
    }

    /// Numeric form: -1 unset, 0 success, 1 failure
    pub fn as_i32(self) -> i32 {
        match self {
            ReturnCode::Unset => -1,
            ReturnCode::Success => 0,
            ReturnCode::Failure => 1,
        }
    }

    pub fn is_success(self) -> bool {
        self == ReturnCode::Success
    }
}
