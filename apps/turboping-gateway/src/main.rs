mod auth;
mod config;
mod error;
mod handlers;
mod routes;
mod state;

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turboping_core::db::Ledger;
use turboping_core::{AesVault, Dispatcher, TelegramNotifier};

use config::GatewayConfig;
use state::AppState;

#[derive(Parser)]
#[command(name = "turboping-gateway")]
#[command(about = "Payment webhooks and internal API for turboping", long_about = None)]
struct Cli {
    /// TOML config file; defaults to /etc/turboping/gateway.toml or ./gateway.toml
    #[arg(long, env = "TURBOPING_GATEWAY_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    /// Directory for gateway.log
    #[arg(long, env = "TURBOPING_LOG_DIR", default_value = ".")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("No .env file loaded: {}", e);
    }
    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::daily(&cli.log_dir, "gateway.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "turboping=debug,turboping_gateway=debug,turboping_core=debug,sqlx=warn,tower_http=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    let config = GatewayConfig::load(cli.config.as_deref(), cli.database_url)?;
    info!("Gateway v{} starting", env!("CARGO_PKG_VERSION"));

    let ledger: Arc<dyn Ledger> = Arc::new(
        turboping_core::db::connect(&config.database_url, config.max_connections).await?,
    );
    let vault = AesVault::from_base64_key(&config.vault_key).context("Invalid vault_key")?;

    let mut dispatcher = Dispatcher::new();
    match &config.bot_token {
        Some(token) => {
            dispatcher =
                dispatcher.with_sink(Arc::new(TelegramNotifier::from_token(token, ledger.clone())));
        }
        None => warn!("No bot token configured; users will not be notified"),
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let state = AppState::new(config, ledger, Arc::new(vault), dispatcher);
    info!("Proxy regions: {}", state.credentials.regions().join(", "));
    let app = routes::router(state);

    info!("Gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
