//! Cluster gateway abstraction
//!
//! The orchestrator talks to a `PodGateway` instead of a concrete HTTP
//! client, so tests can provide a scripted in-memory cluster while
//! production uses [`ClusterClient`](crate::ClusterClient).

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use podrun_core::{Pod, PodId, PodManifest};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Number of tail lines requested when a log stream starts
pub const DEFAULT_TAIL_LINES: i64 = 100_000;

/// Continuous stream of raw output chunks from a pod
pub type LogStream = BoxStream<'static, Result<Vec<u8>>>;

/// Options for fetching pod output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    /// Number of historical lines to include
    pub tail_lines: Option<i64>,
    /// Keep the connection open and stream new output
    pub follow: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            tail_lines: Some(DEFAULT_TAIL_LINES),
            follow: true,
        }
    }
}

/// A change notification for the watched pod
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// The pod was listed, added or modified
    Applied(Pod),
    /// The pod was removed from the cluster
    Deleted(Pod),
    /// Every pod present at list time has been delivered
    Synced,
    /// The watch failed and will be re-established
    Error(String),
}

/// Receiving end of a pod watch
///
/// Events arrive one at a time on a single channel. Dropping the handle
/// stops the background task feeding it.
#[derive(Debug)]
pub struct PodWatch {
    events: mpsc::Receiver<WatchEvent>,
    task: Option<JoinHandle<()>>,
}

impl PodWatch {
    /// Wraps a channel fed by a background task owned by this handle
    pub fn new(events: mpsc::Receiver<WatchEvent>, task: JoinHandle<()>) -> Self {
        Self {
            events,
            task: Some(task),
        }
    }

    /// Wraps a channel fed by someone else (used by in-memory gateways)
    pub fn from_receiver(events: mpsc::Receiver<WatchEvent>) -> Self {
        Self { events, task: None }
    }

    /// Waits for the next event
    ///
    /// # Returns
    /// `None` once the watch has ended for good
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }
}

impl Drop for PodWatch {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Operations the orchestrator needs from the cluster control plane
#[async_trait]
pub trait PodGateway: Send + Sync {
    /// Submits a pod manifest
    ///
    /// # Returns
    /// The pod as accepted by the cluster
    async fn create_pod(&self, manifest: &PodManifest) -> Result<Pod>;

    /// Looks up a pod
    ///
    /// # Returns
    /// `None` if no pod with this identity exists
    async fn get_pod(&self, id: &PodId) -> Result<Option<Pod>>;

    /// Deletes a pod
    ///
    /// # Arguments
    /// * `id` - The pod to delete
    /// * `precondition` - Only delete if the pod still has this resourceVersion
    async fn delete_pod(&self, id: &PodId, precondition: Option<&str>) -> Result<()>;

    /// Starts a resynchronizing watch scoped to a single pod
    ///
    /// The pod's current state is delivered first, followed by
    /// [`WatchEvent::Synced`], then live changes.
    async fn watch_pod(&self, id: &PodId) -> Result<PodWatch>;

    /// Opens the pod's output stream
    async fn pod_logs(&self, id: &PodId, options: LogOptions) -> Result<LogStream>;
}
