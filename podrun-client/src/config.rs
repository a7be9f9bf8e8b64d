//! Cluster connection settings
//!
//! Resolves where the API server lives and how to authenticate against it:
//! - in-cluster, from the service account mounted into every pod
//! - out-of-cluster, from the kubeconfig file named by `KUBECONFIG`
//!
//! Only static credentials are supported (bearer tokens and client
//! certificates). Exec and auth-provider plugins are rejected.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Errors that can occur while resolving cluster settings
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KUBECONFIG not set and not running inside a cluster")]
    KubeconfigNotSet,

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse kubeconfig: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("kubeconfig has no current-context")]
    NoCurrentContext,

    #[error("kubeconfig entry not found: {0}")]
    MissingEntry(String),

    #[error("unsupported authentication method: {0}")]
    UnsupportedAuth(String),

    #[error("invalid base64 data in kubeconfig: {0}")]
    InvalidData(#[from] base64::DecodeError),
}

/// Resolved connection settings for the API server
#[derive(Clone, Default)]
pub struct ClusterConfig {
    /// API server base URL (e.g., "https://10.96.0.1:443")
    pub server: String,
    /// Bearer token sent with every request
    pub token: Option<String>,
    /// PEM encoded CA bundle used to verify the server
    pub ca_pem: Option<Vec<u8>>,
    /// PEM encoded client certificate followed by its private key
    pub identity_pem: Option<Vec<u8>>,
    /// Skip server certificate verification
    pub insecure_skip_tls_verify: bool,
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("server", &self.server)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("ca_pem", &self.ca_pem.is_some())
            .field("identity_pem", &self.identity_pem.is_some())
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .finish()
    }
}

impl ClusterConfig {
    /// Resolves settings: in-cluster first, then `KUBECONFIG`
    pub fn infer() -> Result<Self, ConfigError> {
        if let Some(config) = Self::in_cluster()? {
            info!("Using in-cluster configuration");
            return Ok(config);
        }

        info!("Using out-of-cluster configuration (kubeconfig)");
        let kubeconfig = std::env::var("KUBECONFIG").unwrap_or_default();
        // KUBECONFIG may list several files; the first one wins.
        let first = std::env::split_paths(&kubeconfig)
            .find(|p| !p.as_os_str().is_empty())
            .ok_or(ConfigError::KubeconfigNotSet)?;

        Self::from_kubeconfig(first)
    }

    /// Builds settings from the service account mounted into a pod
    ///
    /// # Returns
    /// `None` when not running inside a cluster
    pub fn in_cluster() -> Result<Option<Self>, ConfigError> {
        let (Ok(host), Ok(port)) = (
            std::env::var("KUBERNETES_SERVICE_HOST"),
            std::env::var("KUBERNETES_SERVICE_PORT"),
        ) else {
            return Ok(None);
        };

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = read_file(&dir.join("token"))?;
        let ca_pem = read_file(&dir.join("ca.crt"))?;

        // IPv6 hosts need brackets in the URL
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host
        };

        Ok(Some(Self {
            server: format!("https://{}:{}", host, port),
            token: Some(String::from_utf8_lossy(&token).trim().to_string()),
            ca_pem: Some(ca_pem),
            identity_pem: None,
            insecure_skip_tls_verify: false,
        }))
    }

    /// Builds settings from the current context of a kubeconfig file
    ///
    /// Relative file references are resolved against the kubeconfig's directory.
    pub fn from_kubeconfig(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading kubeconfig from {}", path.display());

        let contents = read_file(path)?;
        let kubeconfig: Kubeconfig = serde_yaml::from_slice(&contents)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        kubeconfig.resolve(base_dir)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Loads PEM data given inline (base64) or as a file reference
fn load_pem(
    base_dir: &Path,
    data: Option<&str>,
    file: Option<&Path>,
) -> Result<Option<Vec<u8>>, ConfigError> {
    if let Some(data) = data {
        return Ok(Some(STANDARD.decode(data.trim())?));
    }
    match file {
        Some(file) => Ok(Some(read_file(&resolve_path(base_dir, file))?)),
        None => Ok(None),
    }
}

// =============================================================================
// Kubeconfig file format (subset)
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    current_context: Option<String>,
    #[serde(default)]
    contexts: Vec<Named<ContextEntry>>,
    #[serde(default)]
    clusters: Vec<Named<ClusterEntry>>,
    #[serde(default)]
    users: Vec<Named<UserEntry>>,
}

#[derive(Debug, Deserialize)]
struct Named<T> {
    name: String,
    #[serde(alias = "context", alias = "cluster", alias = "user")]
    value: T,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    certificate_authority: Option<PathBuf>,
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<PathBuf>,
    client_certificate: Option<PathBuf>,
    client_certificate_data: Option<String>,
    client_key: Option<PathBuf>,
    client_key_data: Option<String>,
    exec: Option<serde_yaml::Value>,
    auth_provider: Option<serde_yaml::Value>,
}

fn find<'a, T>(entries: &'a [Named<T>], name: &str, kind: &str) -> Result<&'a T, ConfigError> {
    entries
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| &entry.value)
        .ok_or_else(|| ConfigError::MissingEntry(format!("{} {:?}", kind, name)))
}

impl Kubeconfig {
    fn resolve(&self, base_dir: &Path) -> Result<ClusterConfig, ConfigError> {
        let context_name = self
            .current_context
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(ConfigError::NoCurrentContext)?;
        let context = find(&self.contexts, context_name, "context")?;
        let cluster = find(&self.clusters, &context.cluster, "cluster")?;

        let default_user = UserEntry::default();
        let user = match context.user.as_deref() {
            Some(name) => find(&self.users, name, "user")?,
            None => &default_user,
        };

        if user.exec.is_some() {
            return Err(ConfigError::UnsupportedAuth("exec plugin".to_string()));
        }
        if user.auth_provider.is_some() {
            return Err(ConfigError::UnsupportedAuth("auth-provider".to_string()));
        }

        let token = match (&user.token, &user.token_file) {
            (Some(token), _) => Some(token.trim().to_string()),
            (None, Some(file)) => {
                let raw = read_file(&resolve_path(base_dir, file))?;
                Some(String::from_utf8_lossy(&raw).trim().to_string())
            }
            (None, None) => None,
        };

        let ca_pem = load_pem(
            base_dir,
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
        )?;

        let cert = load_pem(
            base_dir,
            user.client_certificate_data.as_deref(),
            user.client_certificate.as_deref(),
        )?;
        let key = load_pem(
            base_dir,
            user.client_key_data.as_deref(),
            user.client_key.as_deref(),
        )?;
        let identity_pem = match (cert, key) {
            (Some(mut cert), Some(key)) => {
                cert.push(b'\n');
                cert.extend_from_slice(&key);
                Some(cert)
            }
            (None, None) => None,
            _ => {
                return Err(ConfigError::UnsupportedAuth(
                    "client certificate without matching key".to_string(),
                ));
            }
        };

        Ok(ClusterConfig {
            server: cluster.server.trim_end_matches('/').to_string(),
            token,
            ca_pem,
            identity_pem,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
        })
    }
}
