/// Raised when a text column holds a value the enum does not know.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Maps a `as_str`/`FromStr` enum onto a Postgres TEXT column.
macro_rules! text_column {
    ($ty:ty) => {
        impl sqlx::Type<sqlx::Postgres> for $ty {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <&str as sqlx::Type<sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<'q, sqlx::Postgres>>::encode(self.as_str(), buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $ty {
            fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
                let raw = <&str as sqlx::Decode<'r, sqlx::Postgres>>::decode(value)?;
                Ok(raw.parse::<$ty>()?)
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use text_column;

pub mod credential;
pub mod observer_log;
pub mod payment;
pub mod payout;
pub mod plan;
pub mod referral;
pub mod subscription;
pub mod user;

pub use credential::{NewProxyCredential, ProxyCredential};
pub use observer_log::{NewObserverLog, ObserverLog};
pub use payment::{NewPayment, Payment, PaymentMethod, PaymentStatus};
pub use payout::{NewReferralPayout, PayoutStatus, ReferralPayout};
pub use plan::{NewSubscriptionPlan, SubscriptionPlan};
pub use referral::Referral;
pub use subscription::{NewSubscription, Subscription, SubscriptionStatus};
pub use user::{NewUser, User};
