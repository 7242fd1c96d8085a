//! agentbox - Main entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use agentbox::{
    config::{OrchestratorConfig, WorkerConfig},
    orchestrator::{Archiver, JobManager, OrchestratorApi, OrchestratorState, PortAllocator},
    sandbox::{DockerProvisioner, check_docker},
    worker::{FATAL_EXIT_CODE, WorkerRuntime},
};

#[derive(Parser, Debug)]
#[command(name = "agentbox")]
#[command(about = "Run natural-language tasks in sandboxed containers driven by an LLM")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator HTTP API
    Serve {
        /// Address to bind (overrides ORCHESTRATOR_BIND)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Run the agent for the task in AGENT_TASK (inside a sandbox)
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    match cli.command {
        Command::Serve { bind } => serve(bind, shutdown).await,
        Command::Worker => {
            let code = match run_worker(shutdown).await {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!("Worker failed: {e:#}");
                    FATAL_EXIT_CODE
                }
            };
            std::process::exit(code);
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agentbox=info,tower_http=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {e}");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    tracing::info!("Shutdown signal received");
    token.cancel();
}

async fn serve(bind: Option<SocketAddr>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut config = OrchestratorConfig::from_env()?;
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }

    let docker = check_docker().await;
    if docker.is_ok() {
        tracing::info!(?docker, "Container runtime available");
    } else if let Some(hint) = docker.hint() {
        tracing::warn!("Container runtime unavailable, scheduling will fail: {hint}");
    }

    tokio::fs::create_dir_all(&config.workspaces_dir).await?;
    tokio::fs::create_dir_all(&config.downloads_dir).await?;

    tracing::info!(
        workspaces = %config.workspaces_dir.display(),
        downloads = %config.downloads_dir.display(),
        image = %config.sandbox.image,
        ports = %format!("{}-{}", config.ports.base, config.ports.end()),
        "Starting orchestrator"
    );

    let jobs = JobManager::new(
        &config.workspaces_dir,
        PortAllocator::new(config.ports),
        Archiver::new(&config.downloads_dir),
        Arc::new(DockerProvisioner::new(config.sandbox.clone())),
    );
    let state = OrchestratorState {
        jobs: Arc::new(jobs),
    };

    OrchestratorApi::start(state, config.bind_addr, shutdown).await?;
    Ok(())
}

async fn run_worker(cancel: CancellationToken) -> anyhow::Result<i32> {
    let config = WorkerConfig::from_env()?;
    let runtime = WorkerRuntime::new(config)?;
    let outcome = runtime.run(cancel).await?;
    Ok(outcome.exit_code())
}
