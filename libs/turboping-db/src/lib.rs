pub mod db;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod repositories;

pub use error::{LedgerError, LedgerResult};
pub use ledger::{Ledger, LedgerTx};
pub use memory::MemoryLedger;
pub use postgres::PgLedger;
pub use sqlx;

use anyhow::Result;

/// Connects, migrates and wraps the pool in a [`PgLedger`].
pub async fn connect(url: &str, max_connections: u32) -> Result<PgLedger> {
    let pool = db::init_db(url, max_connections).await?;
    Ok(PgLedger::new(pool))
}
