//! steprig — test-environment orchestrator for the STEP upload service.
//!
//! Brings up an isolated VM environment, runs the functional and/or
//! performance probe suites against the service, writes a JSON run artifact,
//! and tears the environment down.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use steprig_env::{
    CommandRunner, FaultInjector, HostRunner, LibvirtBackend, ResourceManager,
};
use steprig_probes::ProbeRunner;
use steprig_run::{
    exit_code, write_artifact, RunConfig, SuiteSelection, TestOrchestrator,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// STEP service test orchestrator.
#[derive(Parser, Debug)]
#[command(name = "steprig", about = "Environment orchestrator for STEP service validation")]
struct Cli {
    /// Run configuration file (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Which probe suites to run.
    #[arg(long, value_enum)]
    suite: Option<SuiteSelection>,

    /// Skip environment bring-up, assume it is already running.
    #[arg(long, default_value_t = false)]
    reuse_env: bool,

    /// Skip teardown, leave the environment for inspection.
    #[arg(long, default_value_t = false)]
    keep_env: bool,

    /// Directory the run artifact is written to.
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Host interface impairments are applied to.
    #[arg(long)]
    interface: Option<String>,

    /// Service address override.
    #[arg(long)]
    address: Option<String>,

    /// Service port override.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    if let Some(suite) = cli.suite {
        config.suite = suite;
    }
    if cli.reuse_env {
        config.reuse_env = true;
    }
    if cli.keep_env {
        config.keep_env = true;
    }
    if let Some(dir) = cli.results_dir {
        config.results_dir = dir;
    }
    if let Some(interface) = cli.interface {
        config.env.interface = interface;
    }
    if let Some(address) = cli.address {
        config.endpoint.address = address;
    }
    if let Some(port) = cli.port {
        config.endpoint.port = port;
    }

    tracing::info!(
        endpoint = %config.endpoint().authority(),
        suite = ?config.suite,
        reuse_env = config.reuse_env,
        "steprig starting"
    );

    // Ctrl-C flips the cancel flag; the orchestrator finishes cleanup and
    // still writes a (partial) artifact.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            let _ = cancel_tx.send(true);
        }
    });

    let host_runner: Arc<dyn CommandRunner> = Arc::new(HostRunner::new(config.env.use_sudo));
    let backend = Arc::new(LibvirtBackend::new(host_runner.clone()));
    let resources = ResourceManager::new(backend);
    let injector = FaultInjector::new(host_runner);
    let runner = ProbeRunner::new(config.endpoint());

    let orchestrator =
        TestOrchestrator::new(config.clone(), resources, injector, runner, cancel_rx);
    let outcome = orchestrator.run().await;

    let path = write_artifact(&outcome.summary, &config.results_dir)?;
    tracing::info!(
        artifact = %path.display(),
        overall = ?outcome.summary.overall,
        "run complete"
    );

    std::process::exit(exit_code(&outcome));
}
