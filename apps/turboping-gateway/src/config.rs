use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use turboping_core::db::models::PaymentMethod;
use turboping_core::{EngineConfig, ProxyServer};

const CONFIG_PATHS: [&str; 2] = ["/etc/turboping/gateway.toml", "./gateway.toml"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Bearer token the bot uses for `/api`.
    pub internal_api_token: String,
    /// Bearer token for `/admin`.
    pub admin_api_token: String,
    /// Base64 AES-256 key for proxy credentials.
    pub vault_key: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    /// HMAC secret per rail, keyed by rail name (`ton`, `telegram_stars`, ...).
    #[serde(default)]
    pub webhook_secrets: HashMap<String, String>,
    /// Proxy endpoint per region code.
    #[serde(default)]
    pub proxy_servers: HashMap<String, ProxyServer>,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_max_connections() -> u32 {
    10
}

impl GatewayConfig {
    /// Reads `path` when given, else the first of the standard locations,
    /// else the environment. `database_url` overrides whatever was loaded.
    pub fn load(path: Option<&Path>, database_url: Option<String>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match CONFIG_PATHS.iter().map(Path::new).find(|p| p.exists()) {
                Some(path) => Self::from_file(path)?,
                None => {
                    tracing::info!("Loading config from environment");
                    Self::from_env()?
                }
            },
        };
        if let Some(url) = database_url {
            config.database_url = url;
        }
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        tracing::info!("Loading config from {}", path.display());
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Invalid config in {}", path.display()))
    }

    fn from_env() -> Result<Self> {
        let mut webhook_secrets = HashMap::new();
        for rail in PaymentMethod::ALL {
            let var = format!("WEBHOOK_SECRET_{}", rail.as_str().to_ascii_uppercase());
            if let Ok(secret) = std::env::var(&var) {
                webhook_secrets.insert(rail.as_str().to_string(), secret);
            }
        }

        let proxy_servers = match std::env::var("PROXY_SERVERS") {
            Ok(spec) => parse_proxy_servers(&spec)?,
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            listen_port: std::env::var("LISTEN_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(default_listen_port),
            database_url: std::env::var("DATABASE_URL").unwrap_or_default(),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_connections),
            internal_api_token: std::env::var("INTERNAL_API_TOKEN")
                .context("INTERNAL_API_TOKEN is not set")?,
            admin_api_token: std::env::var("ADMIN_API_TOKEN").context("ADMIN_API_TOKEN is not set")?,
            vault_key: std::env::var("VAULT_KEY").context("VAULT_KEY is not set")?,
            bot_token: std::env::var("BOT_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            webhook_secrets,
            proxy_servers,
            engine: EngineConfig::default(),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            bail!("DATABASE_URL is not set");
        }
        if self.internal_api_token.trim().is_empty() || self.admin_api_token.trim().is_empty() {
            bail!("API tokens must not be empty");
        }
        for rail in self.webhook_secrets.keys() {
            rail.parse::<PaymentMethod>()
                .with_context(|| format!("webhook secret for unknown rail {rail}"))?;
        }
        self.engine.validate()?;
        Ok(())
    }

    pub fn webhook_secret(&self, rail: PaymentMethod) -> Option<&str> {
        self.webhook_secrets
            .get(rail.as_str())
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// `US=us.example.net:1080,EU=eu.example.net:1080`
fn parse_proxy_servers(spec: &str) -> Result<HashMap<String, ProxyServer>> {
    let mut servers = HashMap::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((region, endpoint)) = entry.split_once('=') else {
            bail!("proxy server entry {entry:?} is not REGION=host:port");
        };
        let Some((host, port)) = endpoint.rsplit_once(':') else {
            bail!("proxy server {endpoint:?} has no port");
        };
        let port = port
            .parse()
            .with_context(|| format!("invalid port in {endpoint:?}"))?;
        servers.insert(
            region.trim().to_ascii_uppercase(),
            ProxyServer {
                host: host.to_string(),
                port,
                username_prefix: String::new(),
            },
        );
    }
    Ok(servers)
}
