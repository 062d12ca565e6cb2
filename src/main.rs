use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mcp_gateway::gateway::config::{find_config_path, load_config};
use mcp_gateway::gateway::{
    spawn_reaper, Dispatcher, FrontEnd, GatewayConfig, Registry, RoutingProvider,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend registry (YAML mapping of backend id to entry)
    #[arg(short, long, env = "MCP_GATEWAY_REGISTRY", default_value = "servers.yaml")]
    registry: PathBuf,

    /// Gateway configuration file (YAML)
    #[arg(short, long, env = "MCP_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log to stderr instead of the data-directory log file
    #[arg(long)]
    log_stderr: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Serve the MCP front end on stdin/stdout (default)
    Serve,
    /// Print the aggregated tool catalog as JSON
    ListTools,
    /// Validate the registry and report rejected entries
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match find_config_path(args.config.as_deref()) {
        Some(path) => load_config(&path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => GatewayConfig::default(),
    };

    let command = args.command.unwrap_or(Command::Serve);
    mcp_gateway::init_tracing(&config.log, args.log_stderr || command != Command::Serve);

    let registry = Registry::load(&args.registry, config.default_idle_timeout())
        .with_context(|| format!("failed to load registry {}", args.registry.display()))?;

    match command {
        Command::Serve => serve(config, registry).await,
        Command::ListTools => {
            println!("{}", serde_json::to_string_pretty(&registry.catalog())?);
            Ok(())
        }
        Command::Check => check(&registry),
    }
}

async fn serve(config: GatewayConfig, registry: Registry) -> Result<()> {
    let provider = Arc::new(RoutingProvider::new(config.docker_binary.clone()));
    let dispatcher = Dispatcher::new(Arc::new(registry), provider, &config);
    let reaper = spawn_reaper(dispatcher.state().clone(), config.reap_interval());
    let front = FrontEnd::new(dispatcher.clone());

    let served = tokio::select! {
        result = front.serve(tokio::io::stdin(), tokio::io::stdout(), config.max_line_bytes) => {
            result.context("front end failed")
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    };

    reaper.shutdown().await;
    dispatcher.shutdown_all().await;
    tracing::info!("gateway stopped");
    served
}

fn check(registry: &Registry) -> Result<()> {
    for id in registry.ids() {
        println!("ok        {id}");
    }
    for rejected in registry.rejected() {
        println!("rejected  {}: {}", rejected.id, rejected.error);
    }
    if !registry.rejected().is_empty() {
        anyhow::bail!("{} registry entries rejected", registry.rejected().len());
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
