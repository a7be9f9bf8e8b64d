//! Manifest loading
//!
//! Reads a pod manifest from disk and validates it before anything is sent
//! to the cluster. Only YAML documents are supported.

use std::path::Path;

use thiserror::Error;

use crate::domain::pod::{POD_KIND, PodManifest};

/// Errors that can occur while loading a manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    /// File extension is not a supported format
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// Manifest could not be read
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest is not valid YAML or does not match the pod shape
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Manifest declares a kind other than `Pod`
    #[error("manifest should have pod kind but got {0:?}")]
    WrongKind(String),

    /// Manifest has no `metadata.name`
    #[error("manifest has no metadata.name")]
    MissingName,
}

/// Loads and validates a pod manifest from `path`
///
/// The extension is checked before the file is opened, so an unsupported
/// format fails fast.
pub fn load(path: impl AsRef<Path>) -> Result<PodManifest, ManifestError> {
    let path = path.as_ref();

    let supported = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );
    if !supported {
        return Err(ManifestError::UnsupportedFormat(path.display().to_string()));
    }

    let contents = std::fs::read_to_string(path)?;
    from_yaml_str(&contents)
}

/// Parses and validates a pod manifest from YAML text
pub fn from_yaml_str(input: &str) -> Result<PodManifest, ManifestError> {
    let manifest: PodManifest = serde_yaml::from_str(input)?;

    if manifest.kind != POD_KIND {
        return Err(ManifestError::WrongKind(manifest.kind));
    }

    if manifest.metadata.name.trim().is_empty() {
        return Err(ManifestError::MissingName);
    }

    Ok(manifest)
}
