//! Podrun Cluster Client
//!
//! A small, type-safe client for the pod endpoints of the cluster API.
//!
//! This crate provides the [`PodGateway`] seam the runner is written against,
//! and [`ClusterClient`], the production implementation over HTTP.
//!
//! # Example
//!
//! ```no_run
//! use podrun_client::{ClusterClient, ClusterConfig, PodGateway};
//! use podrun_core::PodId;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClusterClient::from_config(&ClusterConfig::infer()?)?;
//!
//!     if let Some(pod) = client.get_pod(&PodId::new("worker", "default")).await? {
//!         println!("worker is {}", pod.phase());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod gateway;
mod pods;
mod watch;

// Re-export commonly used types
pub use config::{ClusterConfig, ConfigError};
pub use error::{ClientError, Result};
pub use gateway::{LogOptions, LogStream, PodGateway, PodWatch, WatchEvent};

use reqwest::{Certificate, Client, Identity, Method, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// HTTP client for the cluster pod API
///
/// Cloning is cheap; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct ClusterClient {
    /// Base URL of the API server (e.g., "https://10.96.0.1:443")
    base_url: String,
    /// Bearer token attached to every request
    token: Option<String>,
    /// HTTP client instance
    client: Client,
}

/// Error body returned by the API server
#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

impl ClusterClient {
    /// Create a new client without credentials
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the API server
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            client,
        }
    }

    /// Create a client from resolved connection settings
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify);

        if let Some(ca_pem) = &config.ca_pem {
            for cert in Certificate::from_pem_bundle(ca_pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }

        if let Some(identity_pem) = &config.identity_pem {
            builder = builder.identity(Identity::from_pem(identity_pem)?);
        }

        let mut client = Self::with_client(&config.server, builder.build()?);
        client.token = config.token.clone();
        Ok(client)
    }

    /// Get the base URL of the API server
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Builds a request with authentication applied
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Turn a non-success response into an `ApiError`
    ///
    /// The API server answers errors with a `Status` object; its message is
    /// preferred over the raw body when present.
    async fn error_from_response(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        let message = serde_json::from_str::<ApiStatus>(&body)
            .ok()
            .map(|s| s.message)
            .filter(|m| !m.is_empty())
            .unwrap_or(body);

        ClientError::api_error(status, message)
    }

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response whose body is not needed (e.g., DELETE operations)
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        Ok(())
    }

    /// Ensure a streaming response succeeded before handing out its body
    async fn handle_stream_response(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        Ok(response)
    }
}
