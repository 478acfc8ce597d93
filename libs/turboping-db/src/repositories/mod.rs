pub mod credential_repo;
pub mod observer_log_repo;
pub mod payment_repo;
pub mod plan_repo;
pub mod referral_repo;
pub mod subscription_repo;
pub mod user_repo;

pub use credential_repo::CredentialRepository;
pub use observer_log_repo::ObserverLogRepository;
pub use payment_repo::PaymentRepository;
pub use plan_repo::PlanRepository;
pub use referral_repo::ReferralRepository;
pub use subscription_repo::SubscriptionRepository;
pub use user_repo::UserRepository;
