//! Podrun
//!
//! Runs a single pod to completion and relays its output.
//!
//! Architecture:
//! - Configuration: command-line flags parsed once into run options
//! - Orchestrator: pre-flight cleanup, submission, lifecycle watch
//! - Services: log streaming and pod teardown
//!
//! Pod output goes to stdout; podrun's own structured logs go to stderr.
//! The process exits with status 0 only when the pod succeeded.

mod config;
mod context;
mod error;
mod orchestrator;
mod service;
#[cfg(test)]
mod testing;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use podrun_client::{ClusterClient, ClusterConfig};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Cli;
use crate::error::RunError;
use crate::orchestrator::RunOrchestrator;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            init_logging(false);
            error!(error = %e.to_string().trim_end(), "Invalid arguments");
            return ExitCode::FAILURE;
        }
    };

    init_logging(cli.debug);
    cli.log_arguments();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let return_code = e
                .downcast_ref::<RunError>()
                .map(RunError::return_code)
                .unwrap_or(-1);
            error!(
                error = %format!("{:#}", e),
                return_code,
                "Encountered error"
            );
            ExitCode::FAILURE
        }
    }
}

/// Installs the JSON subscriber on stderr
///
/// `PODRUN_LOG` takes precedence over the `--debug` flag when set.
fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("PODRUN_LOG").unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,podrun={0},podrun_client={0},podrun_core={0}",
            level
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_writer(std::io::stderr)
                .with_target(debug)
                .with_file(debug)
                .with_line_number(debug),
        )
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let options = cli.run_options()?;
    let path = cli.manifest_path()?;

    let manifest = podrun_core::manifest::load(path)
        .map_err(RunError::from)
        .with_context(|| format!("Failed to load manifest {}", path.display()))?;
    info!(filepath = %path.display(), "Loaded manifest for pod {}", manifest.id());

    let config = ClusterConfig::infer().map_err(|e| RunError::Config(e.to_string()))?;
    info!(server = %config.server, "Connecting to cluster");
    let client = ClusterClient::from_config(&config).map_err(RunError::from)?;

    let orchestrator = RunOrchestrator::new(Arc::new(client));
    let report = orchestrator.run(&manifest, &options).await?;

    info!(
        run_id = %report.run_id,
        return_code = report.return_code.as_i32(),
        final_phase = ?report.final_phase,
        elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
        "Pod {} finished successfully",
        report.pod
    );

    Ok(())
}
