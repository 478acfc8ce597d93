use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Proxy login for one region. Username and password are stored encrypted;
/// revocation stamps `revoked_at` and keeps the row for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ProxyCredential {
    pub id: i64,
    pub user_id: i64,
    pub region: String,
    pub proxy_host: String,
    pub proxy_port: i32,
    #[serde(skip_serializing)]
    pub username_encrypted: String,
    #[serde(skip_serializing)]
    pub password_encrypted: String,
    pub assigned_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ProxyCredential {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NewProxyCredential {
    pub user_id: i64,
    pub region: String,
    pub proxy_host: String,
    pub proxy_port: i32,
    pub username_encrypted: String,
    pub password_encrypted: String,
    pub assigned_at: DateTime<Utc>,
}
