//! Run orchestrator
//!
//! Drives one pod from submission to removal. Each run gets its own session,
//! log stream registry and teardown guard; nothing is shared between runs
//! except the gateway and the output factory.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use podrun_client::PodGateway;
use podrun_core::{Pod, PodId, PodManifest, PodPhase, ReturnCode};
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::watcher::{LifecycleWatcher, Termination};
use crate::config::RunOptions;
use crate::context::RunSession;
use crate::error::RunError;
use crate::service::{LogStreamRegistry, OutputFactory, Teardown, stdout_output};

/// Interval between lookups while a replaced pod is terminating
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Summary of a successful run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pod: PodId,
    pub return_code: ReturnCode,
    pub final_phase: Option<PodPhase>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Runs pods to completion
pub struct RunOrchestrator {
    gateway: Arc<dyn PodGateway>,
    output: OutputFactory,
    poll_interval: Duration,
}

impl RunOrchestrator {
    /// Creates an orchestrator relaying pod output to stdout
    pub fn new(gateway: Arc<dyn PodGateway>) -> Self {
        Self {
            gateway,
            output: stdout_output(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sends pod output somewhere other than stdout
    pub fn with_output(mut self, output: OutputFactory) -> Self {
        self.output = output;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Runs the manifest's pod until it finishes, vanishes or times out
    ///
    /// # Arguments
    /// * `manifest` - The pod to run
    /// * `options` - Timeouts and cleanup behaviour
    ///
    /// # Returns
    /// A report when the pod succeeded, otherwise the reason it did not
    pub async fn run(
        &self,
        manifest: &PodManifest,
        options: &RunOptions,
    ) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let pod = manifest.id();
        let span = info_span!("run", run_id = %run_id, pod = %pod);

        self.execute(run_id, manifest, options).instrument(span).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        manifest: &PodManifest,
        options: &RunOptions,
    ) -> Result<RunReport, RunError> {
        let pod = manifest.id();
        let started_at = Utc::now();
        options.validate()?;

        if options.replace_old_pod {
            self.remove_lingering_pod(&pod, options.create_timeout).await?;
        }

        self.submit(manifest, options.create_timeout).await?;

        // The run deadline covers everything after submission
        let deadline = Instant::now()
            .checked_add(options.run_timeout)
            .ok_or_else(|| RunError::Config("run-timeout is too large".to_string()))?;
        let mut session = RunSession::new(run_id, pod.clone(), deadline);
        let logs = LogStreamRegistry::new(Arc::clone(&self.gateway));
        let teardown = Teardown::new(
            Arc::clone(&self.gateway),
            pod.clone(),
            options.cleanup_pod,
            options.create_timeout,
        );

        let mut watcher =
            match LifecycleWatcher::start(self.gateway.as_ref(), pod.clone(), session.deadline).await {
                Ok(watcher) => watcher,
                Err(e) => {
                    teardown.run().await;
                    return Err(e);
                }
            };

        let termination = watcher
            .run(&mut session, || self.capture_output(&logs, &pod, deadline))
            .await;
        debug!(
            return_code = termination.return_code().as_i32(),
            "Observation of pod {} ended: {:?}", pod, termination
        );

        if logs.is_active(&pod) {
            logs.drain(session.deadline).await;
        } else {
            debug!("No output captured for pod {}", pod);
        }

        if teardown.run().await
            && !matches!(termination, Termination::Vanished(_))
            && !session.deadline_passed()
        {
            if watcher.wait_for_deletion(session.deadline).await {
                info!("Pod {} deleted", pod);
            } else {
                warn!("Pod {} deletion was not observed before the run deadline", pod);
            }
        }

        let finished_at = Utc::now();
        match termination {
            Termination::Completed(code) if code.is_success() => Ok(RunReport {
                run_id,
                pod,
                return_code: code,
                final_phase: session.phase,
                started_at,
                finished_at,
            }),
            Termination::Completed(code) => Err(RunError::NonZeroReturnCode {
                code: code.as_i32(),
            }),
            Termination::Vanished(code) => Err(RunError::PodVanished {
                pod,
                code: code.as_i32(),
            }),
            Termination::DeadlineExceeded(_) => Err(RunError::RunTimeout {
                timeout: options.run_timeout,
            }),
        }
    }

    fn capture_output(&self, logs: &LogStreamRegistry, pod: &PodId, deadline: Instant) {
        if logs.start_stream(pod, (self.output)(), deadline) {
            info!("Streaming output of pod {}", pod);
        }
    }

    /// Removes a finished pod with the same identity left by an earlier run
    ///
    /// A pod that has not finished is never touched. Lookup and delete
    /// failures are logged; submission reports any conflict that remains.
    async fn remove_lingering_pod(&self, pod: &PodId, timeout: Duration) -> Result<(), RunError> {
        let existing = match tokio::time::timeout(timeout, self.gateway.get_pod(pod)).await {
            Ok(Ok(Some(existing))) => existing,
            Ok(Ok(None)) => {
                debug!("No earlier pod {} to replace", pod);
                return Ok(());
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Could not look up existing pod {}", pod);
                return Ok(());
            }
            Err(_) => {
                warn!("Looking up existing pod {} timed out after {:?}", pod, timeout);
                return Ok(());
            }
        };

        let phase = existing.phase();
        if !phase.is_terminal() {
            return Err(RunError::UnsafeState {
                pod: pod.clone(),
                phase,
            });
        }

        info!("Deleting pod {} left in phase {} by an earlier run", pod, phase);
        let delete = self.gateway.delete_pod(pod, existing.resource_version());
        match tokio::time::timeout(timeout, delete).await {
            Ok(Ok(())) => self.wait_until_gone(&existing, timeout).await,
            Ok(Err(e)) if e.is_not_found() => debug!("Pod {} already gone", pod),
            Ok(Err(e)) if e.is_conflict() => {
                warn!("Pod {} changed since it was inspected, leaving it alone", pod)
            }
            Ok(Err(e)) => warn!(error = %e, "Could not delete existing pod {}", pod),
            Err(_) => warn!("Deleting existing pod {} timed out after {:?}", pod, timeout),
        }

        Ok(())
    }

    /// Polls until a deleted pod has left the cluster
    async fn wait_until_gone(&self, deleted: &Pod, timeout: Duration) {
        let pod = deleted.id();
        let poll = async {
            loop {
                match self.gateway.get_pod(&pod).await {
                    Ok(None) => return,
                    Ok(Some(_)) => debug!("Pod {} still terminating", pod),
                    Err(e) => warn!(error = %e, "Could not look up pod {}", pod),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        if tokio::time::timeout(timeout, poll).await.is_err() {
            warn!("Pod {} still present after {:?}", pod, timeout);
        }
    }

    /// Creates the pod, bounded by the create timeout
    async fn submit(&self, manifest: &PodManifest, timeout: Duration) -> Result<Pod, RunError> {
        let pod = manifest.id();
        info!("Creating pod {}", pod);

        match tokio::time::timeout(timeout, self.gateway.create_pod(manifest)).await {
            Ok(Ok(created)) => {
                info!(
                    uid = created.metadata.uid.as_deref().unwrap_or_default(),
                    "Created pod {}", pod
                );
                Ok(created)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(RunError::Timeout {
                operation: "create pod",
                timeout,
            }),
        }
    }
}
