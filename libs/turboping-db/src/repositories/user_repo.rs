use sqlx::PgPool;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{NewUser, User};

pub(crate) const USER_COLUMNS: &str = "id, telegram_id, username, first_name, language_code, referral_code, \
     referred_by_user_id, region, is_active, is_admin, created_at";

#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the user and, when referred, the referral edge in one
    /// transaction. A concurrent first contact for the same telegram id
    /// loses the `ON CONFLICT` race and gets the winner's row back.
    pub async fn create(&self, new: NewUser) -> LedgerResult<(User, bool)> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (telegram_id, username, first_name, language_code, referral_code, referred_by_user_id, region)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (telegram_id) DO NOTHING
             RETURNING {USER_COLUMNS}"
        ))
        .bind(new.telegram_id)
        .bind(&new.username)
        .bind(&new.first_name)
        .bind(&new.language_code)
        .bind(&new.referral_code)
        .bind(new.referred_by_user_id)
        .bind(&new.region)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(user) = inserted else {
            tx.rollback().await?;
            let existing = self
                .get_by_telegram_id(new.telegram_id)
                .await?
                .ok_or_else(|| LedgerError::Conflict("user vanished after conflict".into()))?;
            return Ok((existing, false));
        };

        if let Some(referrer_id) = user.referred_by_user_id {
            sqlx::query(
                "INSERT INTO referrals (referrer_id, referred_user_id) VALUES ($1, $2)
                 ON CONFLICT (referred_user_id) DO NOTHING",
            )
            .bind(referrer_id)
            .bind(user.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((user, true))
    }

    pub async fn get_by_id(&self, id: i64) -> LedgerResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_by_telegram_id(&self, telegram_id: i64) -> LedgerResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE telegram_id = $1"
        ))
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_by_referral_code(&self, code: &str) -> LedgerResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE referral_code = $1"
        ))
        .bind(code.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }
}
