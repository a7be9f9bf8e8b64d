//! Podrun Core
//!
//! Core types and abstractions shared by the podrun crates.
//!
//! This crate contains:
//! - Domain types: pods, phases, identities and lifecycle events
//! - Manifest loading: reading a pod manifest from disk before any cluster call

pub mod domain;
pub mod manifest;

pub use domain::lifecycle::{PhaseEvent, ReturnCode};
pub use domain::pod::{ObjectMeta, Pod, PodId, PodManifest, PodPhase, PodStatus};
pub use manifest::ManifestError;
