//! Runner configuration
//!
//! Command-line arguments and the immutable options bundle derived from
//! them once at startup.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::debug;

use crate::error::RunError;

/// Run a single pod to completion, streaming its output
#[derive(Debug, Clone, Parser)]
#[command(name = "podrun")]
#[command(about = "Run a pod manifest to completion and stream its output", long_about = None)]
pub struct Cli {
    /// The path to a Pod manifest file (YAML)
    #[arg(short = 'f', long = "file", env = "PODRUN_MANIFEST")]
    pub file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Do not delete the pod at the end of the run
    #[arg(long = "no-rm")]
    pub no_rm: bool,

    /// Seconds to wait for the create pod request to finish
    #[arg(long = "create-timeout", value_name = "SECONDS", default_value_t = 60)]
    pub create_timeout: u64,

    /// Seconds to wait at most for the pod to finish its work
    #[arg(long = "run-timeout", value_name = "SECONDS", default_value_t = 600)]
    pub run_timeout: u64,

    /// Fail instead of replacing a finished pod left over from an earlier run
    #[arg(long = "no-replace")]
    pub no_replace: bool,
}

impl Cli {
    /// Logs every argument at debug level
    pub fn log_arguments(&self) {
        debug!(filepath = ?self.file, "CLI argument");
        debug!(debug = self.debug, "CLI argument");
        debug!(create_timeout = self.create_timeout, "CLI argument");
        debug!(run_timeout = self.run_timeout, "CLI argument");
        debug!(no_rm = self.no_rm, "CLI argument");
        debug!(no_replace = self.no_replace, "CLI argument");
    }

    /// The manifest path, which is required
    pub fn manifest_path(&self) -> Result<&PathBuf, RunError> {
        self.file.as_ref().ok_or_else(|| {
            RunError::Config(
                "A path to a pod manifest must be provided. Use '-f' to specify a manifest file."
                    .to_string(),
            )
        })
    }

    /// Builds and validates the run options
    pub fn run_options(&self) -> Result<RunOptions, RunError> {
        let options = RunOptions {
            create_timeout: Duration::from_secs(self.create_timeout),
            run_timeout: Duration::from_secs(self.run_timeout),
            cleanup_pod: !self.no_rm,
            replace_old_pod: !self.no_replace,
        };
        options.validate()?;
        Ok(options)
    }
}

/// Options for a single run
///
/// Built once from the command line and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Time allowed for creating the pod object on the cluster
    pub create_timeout: Duration,

    /// Time allowed for the rest of the run once the pod exists
    pub run_timeout: Duration,

    /// Whether the pod is deleted at the end of the run
    pub cleanup_pod: bool,

    /// Whether a finished pod with the same identity is removed first
    pub replace_old_pod: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            create_timeout: Duration::from_secs(60),
            run_timeout: Duration::from_secs(600),
            cleanup_pod: true,
            replace_old_pod: true,
        }
    }
}

impl RunOptions {
    /// Validates the options
    ///
    /// Both timeouts must be non-zero and small enough to be turned into a
    /// deadline from now.
    pub fn validate(&self) -> Result<(), RunError> {
        check_timeout("create-timeout", self.create_timeout)?;
        check_timeout("run-timeout", self.run_timeout)
    }
}

fn check_timeout(flag: &str, timeout: Duration) -> Result<(), RunError> {
    if timeout.is_zero() {
        return Err(RunError::Config(format!("{} must be greater than 0", flag)));
    }

    if Instant::now().checked_add(timeout).is_none() {
        return Err(RunError::Config(format!(
            "{} of {}s is too large",
            flag,
            timeout.as_secs()
        )));
    }

    Ok(())
}
