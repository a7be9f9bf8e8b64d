//! Run session state
//!
//! The single mutable record of one run: which pod is targeted, the last
//! phase observed, the return code and the deadline that bounds
//! everything after submission. Owned by the orchestrator and only ever
//! touched by the reconciliation loop, so it needs no locking.

use podrun_core::{PhaseEvent, PodId, PodPhase, ReturnCode};
use tokio::time::Instant;
use uuid::Uuid;

/// What the reconciliation loop should do about a phase observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Same phase as before; nothing to do
    Ignore,
    /// Phase changed but needs no action (Pending, Unknown)
    Observe,
    /// Pod started running; begin capturing output
    StartCapture,
    /// Pod reached a terminal phase; capture output and finish
    Finish(ReturnCode),
}

/// State of one run
#[derive(Debug)]
pub struct RunSession {
    pub run_id: Uuid,
    pub pod: PodId,
    /// Run deadline; expiry is the only cancellation signal
    pub deadline: Instant,
    pub phase: Option<PodPhase>,
    pub return_code: ReturnCode,
    pub last_observed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl RunSession {
    pub fn new(run_id: Uuid, pod: PodId, deadline: Instant) -> Self {
        Self {
            run_id,
            pod,
            deadline,
            phase: None,
            return_code: ReturnCode::Unset,
            last_observed_at: None,
        }
    }

    /// Records a phase observation and decides how to react
    ///
    /// Only a change of phase produces an action; repeated snapshots in the
    /// same phase are ignored.
    pub fn record(&mut self, event: PhaseEvent) -> Reaction {
        if self.phase == Some(event.phase) {
            return Reaction::Ignore;
        }

        self.phase = Some(event.phase);
        self.last_observed_at = Some(event.observed_at);

        match event.phase {
            PodPhase::Pending | PodPhase::Unknown => Reaction::Observe,
            PodPhase::Running => Reaction::StartCapture,
            PodPhase::Succeeded | PodPhase::Failed => {
                let code = ReturnCode::for_phase(event.phase).unwrap_or_default();
                self.return_code = code;
                Reaction::Finish(code)
            }
        }
    }

    pub fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }
}
