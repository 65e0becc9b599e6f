//! llm-relay entry point.

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use relay_mcp::{Aggregator, AggregatorConfig, UpstreamManager};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::{
    agent::AgentRegistry,
    build_router,
    config::{AppConfig, ConfigState},
    router::{Dispatcher, ProviderRegistry, RouterSettings},
    transform::{register_builtins, TransformerRegistry},
    AppState, UsageCache,
};

#[derive(Parser, Debug)]
#[command(name = "llm-relay")]
#[command(about = "Local-host router between LLM clients, providers, and MCP tool servers")]
#[command(version)]
struct Cli {
    /// Bind address
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Bind port
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Shared bearer token required on every route except /health
    #[arg(long, env = "APIKEY")]
    apikey: Option<String>,

    /// Path to the JSON config document
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = tracing_subscriber::registry().with(filter);
    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let mut config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        tracing::warn!(path = %cli.config.display(), "Config file not found, starting empty");
        AppConfig::default()
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.apikey.is_some() {
        config.apikey = cli.apikey;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        providers = config.providers.len(),
        mcp_servers = config.mcp_servers.len(),
        "Starting llm-relay"
    );

    let transformers = Arc::new(TransformerRegistry::new());
    register_builtins(&transformers);

    let agents = Arc::new(AgentRegistry::new());
    let usage = Arc::new(UsageCache::new(config.usage_cache_capacity));
    let providers = Arc::new(ProviderRegistry::new(
        config.providers.clone(),
        config.queue_depth,
    )?);

    let settings = RouterSettings {
        max_tool_rounds: config.max_tool_rounds,
        ..RouterSettings::default()
    };
    let dispatcher = Dispatcher::new(
        Arc::clone(&providers),
        Arc::clone(&transformers),
        Arc::clone(&agents),
        Arc::clone(&usage),
        settings,
    );

    let mcp = Arc::new(UpstreamManager::new(config.mcp_servers.clone()));
    mcp.connect_all().await;
    let aggregator = Aggregator::new(Arc::clone(&mcp), AggregatorConfig::default());

    let bind_addr = format!("{}:{}", config.host, config.port);
    let config_state = Arc::new(ConfigState::new(config, Some(cli.config.clone())));

    let (restart_tx, mut restart_rx) = watch::channel(false);
    let state = AppState {
        dispatcher,
        providers,
        transformers,
        agents,
        usage,
        config: config_state,
        mcp: Arc::clone(&mcp),
        restart: restart_tx,
    };

    let app = build_router(state, &aggregator);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "Listening");

    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down");
            }
            _ = restart_rx.changed() => {
                tracing::info!("Restart signal received, shutting down for supervisor restart");
            }
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    // Give upstream MCP transports a moment to close cleanly.
    tokio::time::timeout(Duration::from_secs(5), mcp.shutdown())
        .await
        .ok();

    tracing::info!("Shutdown complete");
    Ok(())
}
