//! Pod teardown
//!
//! Deletes the run's pod once, no matter how many paths ask for it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use podrun_client::PodGateway;
use podrun_core::PodId;
use tracing::{debug, error, info};

/// One-shot deletion of the run's pod
pub struct Teardown {
    gateway: Arc<dyn PodGateway>,
    pod: PodId,
    enabled: bool,
    timeout: Duration,
    done: AtomicBool,
}

impl Teardown {
    /// # Arguments
    /// * `gateway` - Cluster to delete the pod from
    /// * `pod` - The pod created by this run
    /// * `enabled` - `false` when the pod should be kept (`--no-rm`)
    /// * `timeout` - Upper bound on the delete request
    pub fn new(gateway: Arc<dyn PodGateway>, pod: PodId, enabled: bool, timeout: Duration) -> Self {
        Self {
            gateway,
            pod,
            enabled,
            timeout,
            done: AtomicBool::new(false),
        }
    }

    /// Deletes the pod if cleanup is enabled and no earlier call did so
    ///
    /// Failures are logged, not returned.
    ///
    /// # Returns
    /// `true` if this call deleted the pod, so its removal can still be
    /// observed on the watch
    pub async fn run(&self) -> bool {
        if !self.enabled {
            debug!("Keeping pod {}", self.pod);
            return false;
        }

        if self.done.swap(true, Ordering::SeqCst) {
            debug!("Pod {} already cleaned up", self.pod);
            return false;
        }

        info!("Deleting pod {}", self.pod);
        match tokio::time::timeout(self.timeout, self.gateway.delete_pod(&self.pod, None)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) if e.is_not_found() => {
                debug!("Pod {} was already gone", self.pod);
                false
            }
            Ok(Err(e)) => {
                error!(error = %e, pod = %self.pod, "Could not clean up pod");
                false
            }
            Err(_) => {
                error!(pod = %self.pod, timeout = ?self.timeout, "Timed out deleting pod");
                false
            }
        }
    }
}
