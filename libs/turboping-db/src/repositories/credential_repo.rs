use sqlx::PgPool;

use crate::error::LedgerResult;
use crate::models::ProxyCredential;

pub(crate) const CREDENTIAL_COLUMNS: &str = "id, user_id, region, proxy_host, proxy_port, \
     username_encrypted, password_encrypted, assigned_at, revoked_at";

#[derive(Debug, Clone)]
pub struct CredentialRepository {
    pool: PgPool,
}

impl CredentialRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_active(&self, user_id: i64, region: &str) -> LedgerResult<Option<ProxyCredential>> {
        let credential = sqlx::query_as::<_, ProxyCredential>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM proxy_credentials
             WHERE user_id = $1 AND region = $2 AND revoked_at IS NULL"
        ))
        .bind(user_id)
        .bind(region)
        .fetch_optional(&self.pool)
        .await?;
        Ok(credential)
    }
}
