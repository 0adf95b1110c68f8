use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod migration;
mod models;
mod services;
mod tools;

use config::{AppConfig, MigrationConfig};
use services::abs::AbsClient;

/// Maintenance toolbox for Audiobookshelf servers
#[derive(Parser)]
#[command(name = "abs-toolbox", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the toolbox HTTP API for the web UI
    Serve {
        /// Port to listen on (overrides config.toml)
        #[arg(long, env = "ABS_TOOLBOX_PORT")]
        port: Option<u16>,

        /// Address to bind the server to (overrides config.toml)
        #[arg(long, env = "ABS_TOOLBOX_BIND_ADDRESS")]
        bind: Option<String>,
    },

    /// List the available tools
    Tools,

    /// Run a single tool against the configured server
    Run {
        /// Tool id, see `abs-toolbox tools`
        tool: String,

        /// Form data as JSON
        #[arg(long, conflicts_with = "form_file")]
        form: Option<String>,

        /// File containing the form data as JSON
        #[arg(long)]
        form_file: Option<PathBuf>,
    },
}

/// Shared by every request; each tool run clones what it needs.
pub struct AppState {
    pub client: AbsClient,
    pub migration: MigrationConfig,
}

fn configure_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "abs_toolbox=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Client for the configured (target) server
fn target_client(config: &AppConfig) -> Result<AbsClient> {
    let url = config
        .server_url
        .as_deref()
        .context("No target server configured (set ABS_SERVER_URL or [target] url)")?;
    let token = config
        .api_token
        .as_deref()
        .context("No API token configured (set ABS_API_TOKEN or [target] api_token)")?;

    Ok(AbsClient::new(url, token, config.timeout)?
        .with_items_page_size(config.migration.items_page_size))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    configure_logging();

    let cli = Cli::parse();
    let config = AppConfig::load();

    match cli.command {
        Command::Serve { port, bind } => serve(config, port, bind).await,
        Command::Tools => {
            for tool in tools::TOOLS {
                println!("{:<28} {:<10} {}", tool.id, tool.group, tool.title);
            }
            Ok(())
        }
        Command::Run {
            tool,
            form,
            form_file,
        } => run_once(config, &tool, form, form_file).await,
    }
}

async fn serve(config: AppConfig, port: Option<u16>, bind: Option<String>) -> Result<()> {
    config.log_config();

    let state = Arc::new(AppState {
        client: target_client(&config)?,
        migration: config.migration.clone(),
    });
    let app = api::app(state);

    let port = port.unwrap_or(config.port);
    let bind = bind.unwrap_or_else(|| config.bind_address.clone());
    let listener = tokio::net::TcpListener::bind((bind.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", bind, port))?;
    tracing::info!("Starting server on {}", listener.local_addr()?);

    // Create shutdown signal listener
    let shutdown_signal = async {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn run_once(
    config: AppConfig,
    tool: &str,
    form: Option<String>,
    form_file: Option<PathBuf>,
) -> Result<()> {
    let raw = match (form, form_file) {
        (Some(form), _) => form,
        (None, Some(path)) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => "{}".to_string(),
    };
    let form: Value = serde_json::from_str(&raw).context("Form is not valid JSON")?;

    let client = target_client(&config)?;
    let result = tools::run_tool(tool, client, config.migration.clone(), form)
        .await
        .with_context(|| format!("Unknown tool '{}', see `abs-toolbox tools`", tool))?;

    for line in &result.logs {
        println!("{}", line);
    }
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.success {
        anyhow::bail!(
            "{}: {}",
            result.message,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
