use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use turboping_core::EngineConfig;

const CONFIG_PATHS: [&str; 2] = ["/etc/turboping/observer.toml", "./observer.toml"];

#[derive(Debug, Clone, Deserialize)]
pub struct ObserverConfig {
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_check_interval")]
    pub check_interval_minutes: u64,
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Chat that receives a message when a sweep has failures.
    #[serde(default)]
    pub admin_chat_id: Option<i64>,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_max_connections() -> u32 {
    5
}

fn default_check_interval() -> u64 {
    60
}

impl ObserverConfig {
    pub fn load(path: Option<&Path>, database_url: Option<String>) -> Result<Self> {
        let found = path.or_else(|| CONFIG_PATHS.iter().map(Path::new).find(|p| p.exists()));
        let mut config = match found {
            Some(path) => {
                tracing::info!("Loading config from {}", path.display());
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Invalid config in {}", path.display()))?
            }
            None => {
                tracing::info!("Loading config from environment");
                Self::from_env()?
            }
        };
        if let Some(url) = database_url {
            config.database_url = url;
        }
        config.validate()?;
        Ok(config)
    }

    fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or_default(),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_connections),
            check_interval_minutes: std::env::var("CHECK_INTERVAL_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_check_interval),
            bot_token: std::env::var("BOT_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            admin_chat_id: std::env::var("ADMIN_CHAT_ID").ok().and_then(|v| v.parse().ok()),
            engine: EngineConfig::default(),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            bail!("DATABASE_URL is not set");
        }
        if self.check_interval_minutes == 0 {
            bail!("check_interval_minutes must be at least 1");
        }
        self.engine.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_gets_defaults() {
        let config: ObserverConfig =
            toml::from_str(r#"database_url = "postgres://localhost/turboping""#).unwrap();
        assert_eq!(config.check_interval_minutes, 60);
        assert_eq!(config.engine.reminder_offsets_days, vec![7, 1]);
        assert!(config.admin_chat_id.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config: ObserverConfig = toml::from_str(
            r#"
            database_url = "postgres://localhost/turboping"
            check_interval_minutes = 0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
