mod config;
mod observer;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turboping_core::db::Ledger;
use turboping_core::{Dispatcher, TelegramNotifier};

use config::ObserverConfig;
use observer::Observer;

#[derive(Parser)]
#[command(name = "turboping-observer")]
#[command(about = "Subscription expiry sweep for turboping", long_about = None)]
struct Cli {
    /// TOML config file; defaults to /etc/turboping/observer.toml or ./observer.toml
    #[arg(long, env = "TURBOPING_OBSERVER_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    /// Directory for observer.log
    #[arg(long, env = "TURBOPING_LOG_DIR", default_value = ".")]
    log_dir: PathBuf,
    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("No .env file loaded: {}", e);
    }
    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::daily(&cli.log_dir, "observer.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "turboping=debug,turboping_observer=debug,turboping_core=debug,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    let config = ObserverConfig::load(cli.config.as_deref(), cli.database_url)?;
    info!("Observer v{} starting", env!("CARGO_PKG_VERSION"));

    let ledger: Arc<dyn Ledger> = Arc::new(
        turboping_core::db::connect(&config.database_url, config.max_connections).await?,
    );

    let mut dispatcher = Dispatcher::new();
    let notifier = config
        .bot_token
        .as_deref()
        .map(|token| TelegramNotifier::from_token(token, ledger.clone()));
    match &notifier {
        Some(notifier) => dispatcher = dispatcher.with_sink(Arc::new(notifier.clone())),
        None => warn!("No bot token configured; reminders will not be sent"),
    }

    let mut observer = Observer::new(ledger, Arc::new(config.engine.clone()), dispatcher);
    if let (Some(notifier), Some(chat_id)) = (notifier, config.admin_chat_id) {
        observer = observer.with_admin_alerts(notifier, chat_id);
    }

    if cli.once {
        observer.run_once(chrono::Utc::now()).await?;
        return Ok(());
    }

    observer
        .start(Duration::from_secs(config.check_interval_minutes * 60))
        .await;
    Ok(())
}
