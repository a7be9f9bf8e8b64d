//! Pod API endpoints

use async_trait::async_trait;
use futures_util::StreamExt;
use podrun_core::{Pod, PodId, PodManifest};
use reqwest::Method;
use serde::Serialize;
use tracing::debug;

use crate::ClusterClient;
use crate::error::{ClientError, Result};
use crate::gateway::{LogOptions, LogStream, PodGateway, PodWatch};

/// Body of a DELETE request carrying a resourceVersion precondition
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteOptions<'a> {
    api_version: &'static str,
    kind: &'static str,
    preconditions: Preconditions<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Preconditions<'a> {
    resource_version: &'a str,
}

impl ClusterClient {
    // =============================================================================
    // URL Helpers
    // =============================================================================

    pub(crate) fn pods_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.base_url, namespace)
    }

    pub(crate) fn pod_url(&self, id: &PodId) -> String {
        format!("{}/{}", self.pods_url(&id.namespace), id.name)
    }

    // =============================================================================
    // Pod Lifecycle
    // =============================================================================

    /// Submit a pod manifest into its namespace
    pub async fn create_pod(&self, manifest: &PodManifest) -> Result<Pod> {
        let url = self.pods_url(manifest.metadata.namespace_or_default());
        let response = self.request(Method::POST, &url).json(manifest).send().await?;

        self.handle_response(response).await
    }

    /// Get a pod, mapping 404 to `None`
    pub async fn get_pod(&self, id: &PodId) -> Result<Option<Pod>> {
        let response = self.request(Method::GET, &self.pod_url(id)).send().await?;

        match self.handle_response::<Pod>(response).await {
            Ok(pod) => Ok(Some(pod)),
            Err(e) if e.is_not_found() => {
                debug!("Pod {} not found", id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a pod
    ///
    /// # Arguments
    /// * `id` - The pod to delete
    /// * `precondition` - resourceVersion the pod must still have; a
    ///   mismatch is answered with 409 Conflict
    pub async fn delete_pod(&self, id: &PodId, precondition: Option<&str>) -> Result<()> {
        let mut request = self.request(Method::DELETE, &self.pod_url(id));

        if let Some(resource_version) = precondition {
            request = request.json(&DeleteOptions {
                api_version: "v1",
                kind: "DeleteOptions",
                preconditions: Preconditions { resource_version },
            });
        }

        let response = request.send().await?;
        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Pod Output
    // =============================================================================

    /// Open the pod's output as a byte stream
    pub async fn pod_logs(&self, id: &PodId, options: LogOptions) -> Result<LogStream> {
        let url = format!("{}/log", self.pod_url(id));

        let mut query: Vec<(&str, String)> = vec![("follow", options.follow.to_string())];
        if let Some(tail_lines) = options.tail_lines {
            query.push(("tailLines", tail_lines.to_string()));
        }

        let response = self.request(Method::GET, &url).query(&query).send().await?;
        let response = self.handle_stream_response(response).await?;

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ClientError::from));

        Ok(stream.boxed())
    }
}

#[async_trait]
impl PodGateway for ClusterClient {
    async fn create_pod(&self, manifest: &PodManifest) -> Result<Pod> {
        ClusterClient::create_pod(self, manifest).await
    }

    async fn get_pod(&self, id: &PodId) -> Result<Option<Pod>> {
        ClusterClient::get_pod(self, id).await
    }

    async fn delete_pod(&self, id: &PodId, precondition: Option<&str>) -> Result<()> {
        ClusterClient::delete_pod(self, id, precondition).await
    }

    async fn watch_pod(&self, id: &PodId) -> Result<PodWatch> {
        Ok(crate::watch::spawn_pod_watch(self.clone(), id.clone()))
    }

    async fn pod_logs(&self, id: &PodId, options: LogOptions) -> Result<LogStream> {
        ClusterClient::pod_logs(self, id, options).await
    }
}
