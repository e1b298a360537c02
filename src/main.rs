//! multiclaw - one gateway in front of many coding agents
//!
//! Supervises the configured agent processes and serves the HTTP and
//! WebSocket API that routes prompts to them.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use multiclaw::{
    agent::AgentRegistry,
    config::MulticlawConfig,
    gateway::{self, GatewayBuilder},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "multiclaw")]
#[command(version)]
#[command(about = "Gateway for long-lived coding agent processes")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MULTICLAW_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and its agent processes
    Gateway {
        /// Host to bind to (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },

    /// List configured agents and the default agent
    Agents,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Gateway { host, port } => {
            run_gateway(config, host, port).await?;
        }
        Commands::Agents => {
            show_agents(&config)?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("MULTICLAW_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| format!("multiclaw={},tower_http=info", log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<MulticlawConfig> {
    if let Some(path) = path {
        return MulticlawConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()));
    }

    match MulticlawConfig::default_path() {
        Some(path) if path.exists() => {
            tracing::debug!(path = %path.display(), "Using default configuration file");
            MulticlawConfig::load(&path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))
        }
        _ => Ok(MulticlawConfig::default()),
    }
}

async fn run_gateway(
    config: MulticlawConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let mut builder = GatewayBuilder::new().config(config);
    if let Some(host) = host {
        builder = builder.host(host);
    }
    if let Some(port) = port {
        builder = builder.port(port);
    }

    let gateway = Arc::new(builder.build()?);
    gateway.start()?;

    let addr = format!("{}:{}", gateway.config().gateway.host, gateway.config().gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(address = %addr, "Multiclaw gateway listening. Press Ctrl+C to stop.");

    let app = gateway::router(gateway.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");
    gateway.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn show_agents(config: &MulticlawConfig) -> Result<()> {
    let registry = AgentRegistry::init_agents(config)
        .context("No usable agents configured")?;

    for entry in registry.list_entries() {
        let marker = if entry.id == registry.default_agent_id() {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<12} {:<16} keywords: {}",
            marker,
            entry.id,
            entry.name,
            entry.keywords.join(", ")
        );
    }
    Ok(())
}

fn show_config(config: Option<&MulticlawConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
