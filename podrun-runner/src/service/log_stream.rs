//! Log stream registry
//!
//! Copies a pod's output to a sink in the background. At most one stream is
//! active per pod: asking again for a pod that already has one is a no-op.
//! Each run builds its own registry, so a later run of the same pod
//! streams its output again.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use futures_util::StreamExt;
use parking_lot::Mutex;
use podrun_client::{LogOptions, PodGateway};
use podrun_core::PodId;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Destination for a pod's output
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Produces a fresh sink for each stream
pub type OutputFactory = Arc<dyn Fn() -> OutputSink + Send + Sync>;

/// Output factory writing to the process's standard output
pub fn stdout_output() -> OutputFactory {
    Arc::new(|| Box::new(tokio::io::stdout()))
}

/// Tracks the output streams started during a run
pub struct LogStreamRegistry {
    gateway: Arc<dyn PodGateway>,
    options: LogOptions,
    /// Keyed by `name@namespace`. Entries stay after their task is drained
    /// so a late request for the same pod is still a no-op.
    active: Mutex<HashMap<String, Option<JoinHandle<()>>>>,
}

impl LogStreamRegistry {
    /// Creates a registry that follows output with the default tail
    pub fn new(gateway: Arc<dyn PodGateway>) -> Self {
        Self {
            gateway,
            options: LogOptions::default(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Starts copying the pod's output into `sink` unless already doing so
    ///
    /// The lookup and the insertion happen under one lock. The fetch and
    /// the copy run in a spawned task that stops at `deadline`.
    ///
    /// # Returns
    /// `true` if a new stream was started
    pub fn start_stream(&self, pod: &PodId, sink: OutputSink, deadline: Instant) -> bool {
        let key = pod.to_string();
        let mut active = self.active.lock();

        if active.contains_key(&key) {
            debug!("Already fetching logs for {}", key);
            return false;
        }

        debug!("Starting log stream for {}", key);
        let task = tokio::spawn(copy_output(
            Arc::clone(&self.gateway),
            pod.clone(),
            self.options,
            sink,
            deadline,
        ));
        active.insert(key, Some(task));
        true
    }

    pub fn is_active(&self, pod: &PodId) -> bool {
        self.active.lock().contains_key(&pod.to_string())
    }

    /// Number of pods a stream was started for
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Waits for outstanding streams to finish, aborting those still
    /// running at `deadline`
    pub async fn drain(&self, deadline: Instant) {
        let tasks: Vec<(String, JoinHandle<()>)> = self
            .active
            .lock()
            .iter_mut()
            .filter_map(|(key, task)| task.take().map(|task| (key.clone(), task)))
            .collect();

        debug!(
            "Draining {} of {} log stream(s)",
            tasks.len(),
            self.active_count()
        );
        for (key, mut task) in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => debug!("Log stream for {} finished", key),
                Ok(Err(e)) => warn!("Log stream task for {} failed: {}", key, e),
                Err(_) => {
                    debug!("Log stream for {} still open, stopping it", key);
                    task.abort();
                }
            }
        }
    }
}

/// Fetches the pod's output and copies it into `sink` until the stream
/// ends or the deadline passes
async fn copy_output(
    gateway: Arc<dyn PodGateway>,
    pod: PodId,
    options: LogOptions,
    mut sink: OutputSink,
    deadline: Instant,
) {
    let copy = async {
        let mut stream = gateway
            .pod_logs(&pod, options)
            .await
            .context("Failed to open log stream")?;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed to read log stream")?;
            sink.write_all(&chunk)
                .await
                .context("Failed to write pod output")?;
            sink.flush().await.context("Failed to flush pod output")?;
        }

        anyhow::Ok(())
    };

    match tokio::time::timeout_at(deadline, copy).await {
        Ok(Ok(())) => debug!("Log stream for {} reached its end", pod),
        Ok(Err(e)) => error!(error = %format!("{:#}", e), "Encountered error while reading pod logs"),
        Err(_) => debug!("Run deadline reached while streaming logs for {}", pod),
    }
}
