use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};
use turboping_db::models::{NewUser, User};
use turboping_db::{Ledger, LedgerError};

use crate::error::{EngineError, EngineResult};

const REFERRAL_CODE_LEN: usize = 8;
const REFERRAL_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_ATTEMPTS: u32 = 5;

pub const DEFAULT_REGION: &str = "US";

/// First contact from the bot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Registration {
    pub telegram_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Code of the user who shared the invite link.
    #[serde(default)]
    pub referral_code: Option<String>,
}

#[derive(Clone)]
pub struct UserService {
    ledger: Arc<dyn Ledger>,
}

impl UserService {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Idempotent on telegram id: a known user comes back untouched and the
    /// referrer is never reassigned. Returns whether the user was created.
    pub async fn register(&self, registration: Registration) -> EngineResult<(User, bool)> {
        if let Some(existing) = self
            .ledger
            .user_by_telegram_id(registration.telegram_id)
            .await?
        {
            return Ok((existing, false));
        }

        let referred_by_user_id = self.resolve_referrer(&registration).await?;
        let region = registration
            .region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_ascii_uppercase)
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        for attempt in 1..=CODE_ATTEMPTS {
            let new = NewUser {
                telegram_id: registration.telegram_id,
                username: registration.username.clone(),
                first_name: registration.first_name.clone(),
                language_code: registration.language_code.clone(),
                referral_code: generate_referral_code(),
                referred_by_user_id,
                region: region.clone(),
            };
            match self.ledger.create_user(new).await {
                Ok((user, created)) => {
                    if created {
                        info!(
                            "Registered user {} (telegram {}) referred by {:?}",
                            user.id, user.telegram_id, user.referred_by_user_id
                        );
                    }
                    return Ok((user, created));
                }
                Err(LedgerError::Conflict(reason)) => {
                    warn!("Referral code collision (attempt {}): {}", attempt, reason);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Storage(LedgerError::Conflict(format!(
            "no free referral code after {CODE_ATTEMPTS} attempts"
        ))))
    }

    /// Soft (de)activation. A deactivated user keeps their history but
    /// cannot start trials, create intents or receive credentials.
    pub async fn set_active(&self, user_id: i64, active: bool) -> EngineResult<User> {
        let mut tx = self.ledger.begin(user_id).await?;
        tx.set_user_active(active).await?;
        let user = tx.user().clone();
        tx.commit().await?;

        info!(
            "User {} {}",
            user_id,
            if active { "reactivated" } else { "deactivated" }
        );
        Ok(user)
    }

    async fn resolve_referrer(&self, registration: &Registration) -> EngineResult<Option<i64>> {
        let Some(code) = registration
            .referral_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        else {
            return Ok(None);
        };

        match self.ledger.user_by_referral_code(&code.to_ascii_uppercase()).await? {
            Some(referrer) if referrer.telegram_id != registration.telegram_id => {
                Ok(Some(referrer.id))
            }
            Some(_) => Ok(None),
            None => {
                warn!("Ignoring unknown referral code {}", code);
                Ok(None)
            }
        }
    }
}

pub fn generate_referral_code() -> String {
    (0..REFERRAL_CODE_LEN)
        .map(|_| {
            let idx = rand::random_range(0..REFERRAL_CODE_CHARSET.len());
            char::from(REFERRAL_CODE_CHARSET[idx])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use turboping_db::MemoryLedger;

    fn service() -> (MemoryLedger, UserService) {
        let ledger = MemoryLedger::new();
        let service = UserService::new(Arc::new(ledger.clone()));
        (ledger, service)
    }

    #[test]
    fn referral_codes_are_eight_uppercase_alphanumerics() {
        for _ in 0..50 {
            let code = generate_referral_code();
            assert_eq!(code.len(), 8);
            assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let (_, users) = service();
        let (first, created) = users
            .register(Registration {
                telegram_id: 100,
                region: Some("eu".into()),
                ..Registration::default()
            })
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.region, "EU");

        let (again, created) = users
            .register(Registration {
                telegram_id: 100,
                ..Registration::default()
            })
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again, first);
    }

    #[tokio::test]
    async fn referral_code_links_referrer_once() {
        let (ledger, users) = service();
        let (referrer, _) = users
            .register(Registration {
                telegram_id: 1,
                ..Registration::default()
            })
            .await
            .unwrap();

        let (referred, _) = users
            .register(Registration {
                telegram_id: 2,
                referral_code: Some(referrer.referral_code.to_lowercase()),
                ..Registration::default()
            })
            .await
            .unwrap();
        assert_eq!(referred.referred_by_user_id, Some(referrer.id));

        let (other, _) = users
            .register(Registration {
                telegram_id: 3,
                ..Registration::default()
            })
            .await
            .unwrap();
        let (same, _) = users
            .register(Registration {
                telegram_id: 2,
                referral_code: Some(other.referral_code.clone()),
                ..Registration::default()
            })
            .await
            .unwrap();
        assert_eq!(same.referred_by_user_id, Some(referrer.id));
        assert_eq!(ledger.referrals_by_referrer(referrer.id).await.unwrap().len(), 1);
        assert!(ledger.referrals_by_referrer(other.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_referral_code_is_ignored() {
        let (_, users) = service();
        let (user, created) = users
            .register(Registration {
                telegram_id: 9,
                referral_code: Some("NOPE0000".into()),
                ..Registration::default()
            })
            .await
            .unwrap();
        assert!(created);
        assert_eq!(user.referred_by_user_id, None);
    }

    #[tokio::test]
    async fn deactivation_is_persisted_and_reversible() {
        let (ledger, users) = service();
        let (user, _) = users
            .register(Registration {
                telegram_id: 12,
                ..Registration::default()
            })
            .await
            .unwrap();
        assert!(user.is_active);

        let off = users.set_active(user.id, false).await.unwrap();
        assert!(!off.is_active);
        assert!(!ledger.user(user.id).await.unwrap().unwrap().is_active);

        let on = users.set_active(user.id, true).await.unwrap();
        assert!(on.is_active);
        assert!(matches!(
            users.set_active(999, false).await,
            Err(EngineError::UnknownUser(999))
        ));
    }
}
