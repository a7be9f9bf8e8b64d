//! Lifecycle watcher
//!
//! Turns the gateway's pod watch into phase and deletion events and runs
//! the reconciliation loop that reacts to them until the run terminates.

use std::collections::VecDeque;

use podrun_client::{PodGateway, PodWatch, WatchEvent};
use podrun_core::{PhaseEvent, Pod, PodId, ReturnCode};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::context::{Reaction, RunSession};
use crate::error::RunError;

/// A change to the watched pod
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A snapshot of the pod; pods marked for deletion still report here
    Phase { event: PhaseEvent, snapshot: Pod },
    /// The pod is gone from the cluster
    Deleted,
}

/// How a run's observation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The pod reached a terminal phase
    Completed(ReturnCode),
    /// The pod was deleted before reaching a terminal phase
    Vanished(ReturnCode),
    /// The run deadline passed first
    DeadlineExceeded(ReturnCode),
}

impl Termination {
    pub fn return_code(self) -> ReturnCode {
        match self {
            Termination::Completed(code)
            | Termination::Vanished(code)
            | Termination::DeadlineExceeded(code) => code,
        }
    }
}

/// Watches a single pod for the duration of a run
pub struct LifecycleWatcher {
    pod: PodId,
    watch: PodWatch,
    /// Events received while waiting for the initial sync
    pending: VecDeque<LifecycleEvent>,
    closed: bool,
}

impl LifecycleWatcher {
    /// Opens the watch and waits until the pod's current state is known
    ///
    /// # Arguments
    /// * `gateway` - Cluster to watch
    /// * `pod` - The pod to follow
    /// * `deadline` - Give up on the initial sync at this point
    pub async fn start(
        gateway: &dyn PodGateway,
        pod: PodId,
        deadline: Instant,
    ) -> Result<Self, RunError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        let watch = gateway.watch_pod(&pod).await?;

        let mut watcher = Self {
            pod,
            watch,
            pending: VecDeque::new(),
            closed: false,
        };

        match tokio::time::timeout_at(deadline, watcher.wait_for_sync()).await {
            Ok(true) => {
                debug!(
                    "Watch for pod {} synchronized with {} initial event(s)",
                    watcher.pod,
                    watcher.pending.len()
                );
                Ok(watcher)
            }
            Ok(false) => Err(RunError::WatchClosed { pod: watcher.pod }),
            Err(_) => Err(RunError::Timeout {
                operation: "synchronize pod watch",
                timeout: budget,
            }),
        }
    }

    /// Queues events until the watch reports its initial list delivered
    async fn wait_for_sync(&mut self) -> bool {
        loop {
            match self.watch.next().await {
                Some(WatchEvent::Synced) => return true,
                Some(event) => {
                    if let Some(event) = self.translate(event) {
                        self.pending.push_back(event);
                    }
                }
                None => {
                    self.closed = true;
                    return false;
                }
            }
        }
    }

    fn translate(&self, event: WatchEvent) -> Option<LifecycleEvent> {
        match event {
            WatchEvent::Applied(snapshot) => Some(LifecycleEvent::Phase {
                event: PhaseEvent::now(snapshot.phase()),
                snapshot,
            }),
            WatchEvent::Deleted(_) => Some(LifecycleEvent::Deleted),
            WatchEvent::Synced => {
                debug!("Watch for pod {} resynchronized", self.pod);
                None
            }
            WatchEvent::Error(message) => {
                warn!("Watch for pod {} interrupted: {}", self.pod, message);
                None
            }
        }
    }

    /// Next lifecycle event, or `None` once the watch has ended
    async fn next_event(&mut self) -> Option<LifecycleEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }

        while !self.closed {
            match self.watch.next().await {
                Some(event) => {
                    if let Some(event) = self.translate(event) {
                        return Some(event);
                    }
                }
                None => self.closed = true,
            }
        }
        None
    }

    /// Reacts to lifecycle events until the run terminates
    ///
    /// `capture` is invoked when the pod starts running and again when it
    /// reaches a terminal phase.
    ///
    /// # Returns
    /// How the run ended; produced exactly once per run
    pub async fn run(&mut self, session: &mut RunSession, mut capture: impl FnMut()) -> Termination {
        loop {
            let next = tokio::select! {
                _ = tokio::time::sleep_until(session.deadline) => {
                    warn!("Run deadline reached before pod {} finished", session.pod);
                    return Termination::DeadlineExceeded(session.return_code);
                }
                event = self.next_event(), if !self.closed => event,
            };

            let (event, snapshot) = match next {
                Some(LifecycleEvent::Phase { event, snapshot }) => (event, snapshot),
                Some(LifecycleEvent::Deleted) => {
                    warn!("Pod {} was deleted before it finished", session.pod);
                    return Termination::Vanished(session.return_code);
                }
                None => {
                    error!(
                        "Watch for pod {} ended, waiting for the run deadline",
                        session.pod
                    );
                    continue;
                }
            };

            match session.record(event) {
                Reaction::Ignore => {}
                Reaction::Observe => info!("Pod {} is {}", session.pod, event.phase),
                Reaction::StartCapture => {
                    info!("Pod {} is running", session.pod);
                    capture();
                }
                Reaction::Finish(code) => {
                    debug!(
                        run_id = %session.run_id,
                        observed_at = ?session.last_observed_at,
                        "Pod {} reached terminal phase {}", session.pod, event.phase
                    );
                    if code.is_success() {
                        info!("Pod {} succeeded", session.pod);
                    } else {
                        let status = snapshot.status.as_ref();
                        error!(
                            pod = %session.pod,
                            status_message = snapshot.status_message().unwrap_or_default(),
                            reason = status.and_then(|s| s.reason.as_deref()).unwrap_or_default(),
                            containers = ?status.map(|s| &s.container_statuses),
                            "Pod failed"
                        );
                    }
                    capture();
                    return Termination::Completed(code);
                }
            }
        }
    }

    /// Waits for the pod's deletion to show up on the watch
    ///
    /// # Returns
    /// `false` if the deadline passed or the watch ended first
    pub async fn wait_for_deletion(&mut self, deadline: Instant) -> bool {
        let deleted = async {
            while let Some(event) = self.next_event().await {
                if matches!(event, LifecycleEvent::Deleted) {
                    return true;
                }
            }
            false
        };

        match tokio::time::timeout_at(deadline, deleted).await {
            Ok(seen) => seen,
            Err(_) => {
                debug!("Deletion of pod {} not observed before the deadline", self.pod);
                false
            }
        }
    }
}
