use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use turboping_db::{Ledger, LedgerTx};
use turboping_db::models::{NewProxyCredential, ProxyCredential};

use crate::error::{EngineError, EngineResult};
use crate::vault::CredentialVault;

const USERNAME_SUFFIX_LEN: usize = 4;
const USERNAME_MAX_LEN: usize = 32;
const PASSWORD_LEN: usize = 16;
const USERNAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";

/// Proxy endpoint serving one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyServer {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username_prefix: String,
}

/// Decrypted credential, only ever built for display to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevealedCredential {
    pub region: String,
    pub host: String,
    pub port: i32,
    pub username: String,
    pub password: String,
}

#[derive(Clone)]
pub struct CredentialService {
    ledger: Arc<dyn Ledger>,
    vault: Arc<dyn CredentialVault>,
    servers: Arc<HashMap<String, ProxyServer>>,
}

impl CredentialService {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        vault: Arc<dyn CredentialVault>,
        servers: HashMap<String, ProxyServer>,
    ) -> Self {
        let servers = servers
            .into_iter()
            .map(|(region, server)| (region.to_ascii_uppercase(), server))
            .collect();
        Self {
            ledger,
            vault,
            servers: Arc::new(servers),
        }
    }

    pub fn regions(&self) -> Vec<&str> {
        let mut regions: Vec<_> = self.servers.keys().map(String::as_str).collect();
        regions.sort_unstable();
        regions
    }

    /// Returns the user's active credential for `region`, creating it on
    /// first use.
    pub async fn issue(
        &self,
        user_id: i64,
        region: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<ProxyCredential> {
        let region = region.trim().to_ascii_uppercase();
        let server = self
            .servers
            .get(&region)
            .ok_or_else(|| EngineError::UnknownRegion(region.clone()))?;

        let mut tx = self.ledger.begin(user_id).await?;
        if !tx.user().is_active {
            tx.rollback().await?;
            return Err(EngineError::UserDeactivated(user_id));
        }
        if let Some(existing) = tx.active_credential(&region).await? {
            tx.rollback().await?;
            return Ok(existing);
        }

        let credential = match self.insert_for(tx.as_mut(), server, &region, now).await {
            Ok(credential) => credential,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };
        tx.commit().await?;

        info!("Issued proxy credential {} for user {} in {}", credential.id, user_id, region);
        Ok(credential)
    }

    /// Moves the user to `region`: the old region's credential is revoked,
    /// the user row updated and, while the user has a live subscription, a
    /// credential for the new region issued, all in one transaction.
    pub async fn change_region(
        &self,
        user_id: i64,
        region: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<ProxyCredential>> {
        let region = region.trim().to_ascii_uppercase();
        let server = self
            .servers
            .get(&region)
            .ok_or_else(|| EngineError::UnknownRegion(region.clone()))?;

        let mut tx = self.ledger.begin(user_id).await?;
        if !tx.user().is_active {
            tx.rollback().await?;
            return Err(EngineError::UserDeactivated(user_id));
        }
        let previous = tx.user().region.clone();

        let result = self
            .relocate(tx.as_mut(), &previous, &region, server, now)
            .await;
        let credential = match result {
            Ok(credential) => credential,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };
        tx.commit().await?;

        info!("User {} moved from region {} to {}", user_id, previous, region);
        Ok(credential)
    }

    async fn relocate(
        &self,
        tx: &mut dyn LedgerTx,
        previous: &str,
        region: &str,
        server: &ProxyServer,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<ProxyCredential>> {
        if previous != region {
            tx.revoke_credentials(Some(previous), now).await?;
            tx.update_user_region(region).await?;
        }
        if tx.live_subscriptions().await?.is_empty() {
            return Ok(None);
        }
        match tx.active_credential(region).await? {
            Some(existing) => Ok(Some(existing)),
            None => self.insert_for(tx, server, region, now).await.map(Some),
        }
    }

    async fn insert_for(
        &self,
        tx: &mut dyn LedgerTx,
        server: &ProxyServer,
        region: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<ProxyCredential> {
        let user_id = tx.user().id;
        let username = proxy_username(&server.username_prefix, user_id, region);
        let password = random_string(PASSWORD_CHARSET, PASSWORD_LEN);
        let credential = tx
            .insert_credential(NewProxyCredential {
                user_id,
                region: region.to_string(),
                proxy_host: server.host.clone(),
                proxy_port: i32::from(server.port),
                username_encrypted: self.vault.encrypt(&username)?,
                password_encrypted: self.vault.encrypt(&password)?,
                assigned_at: now,
            })
            .await?;
        Ok(credential)
    }

    /// Soft-revokes active credentials, every region when `region` is `None`.
    pub async fn revoke(
        &self,
        user_id: i64,
        region: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<u64> {
        let region = region.map(|r| r.trim().to_ascii_uppercase());
        let mut tx = self.ledger.begin(user_id).await?;
        let revoked = tx.revoke_credentials(region.as_deref(), now).await?;
        tx.commit().await?;

        info!("Revoked {} credentials for user {}", revoked, user_id);
        Ok(revoked)
    }

    /// Replaces the user's credential for `region` with a fresh one.
    pub async fn rotate(
        &self,
        user_id: i64,
        region: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<ProxyCredential> {
        self.revoke(user_id, Some(region), now).await?;
        self.issue(user_id, region, now).await
    }

    pub fn reveal(&self, credential: &ProxyCredential) -> EngineResult<RevealedCredential> {
        Ok(RevealedCredential {
            region: credential.region.clone(),
            host: credential.proxy_host.clone(),
            port: credential.proxy_port,
            username: self.vault.decrypt(&credential.username_encrypted)?,
            password: self.vault.decrypt(&credential.password_encrypted)?,
        })
    }
}

fn random_string(charset: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| char::from(charset[rand::random_range(0..charset.len())]))
        .collect()
}

/// `<prefix><user id>_<region>_<4 random>`, cut to 32 characters.
fn proxy_username(prefix: &str, user_id: i64, region: &str) -> String {
    let mut username = format!(
        "{prefix}{user_id}_{}_{}",
        region.to_ascii_lowercase(),
        random_string(USERNAME_CHARSET, USERNAME_SUFFIX_LEN)
    );
    username.truncate(USERNAME_MAX_LEN);
    username
}
