//! Subscription lifecycle and payment reconciliation engine.
//!
//! Every service here is stateless: it holds an `Arc<dyn Ledger>` plus an
//! [`EngineConfig`] and does all of its work inside per-user ledger
//! transactions, so the services can be cloned and called from any task.

pub mod commission;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod intents;
pub mod lifecycle;
pub mod notification;
pub mod notify;
pub mod payouts;
pub mod reconciler;
pub mod users;
pub mod vault;

pub use commission::{CommissionCalculator, CommissionDelta};
pub use config::{CommissionPolicy, EngineConfig};
pub use credentials::{CredentialService, ProxyServer, RevealedCredential};
pub use error::{EngineError, EngineResult};
pub use events::{Dispatcher, EventSink, LifecycleEvent, RecordingSink};
pub use intents::PaymentIntents;
pub use lifecycle::{Lifecycle, SweepReport};
pub use notification::{PaymentNotification, ReconciliationOutcome};
pub use notify::TelegramNotifier;
pub use payouts::PayoutService;
pub use reconciler::Reconciler;
pub use users::{Registration, UserService};
pub use vault::{AesVault, CredentialVault, VaultError};

pub use turboping_db as db;
