//! Core domain types
//!
//! These types describe the single workload unit podrun drives. The manifest
//! types are what the user submits; the snapshot types are what the cluster
//! reports back while the pod runs.

pub mod lifecycle;
pub mod pod;
