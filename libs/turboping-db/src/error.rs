use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// A concurrent writer won: unique violation, serialization failure or
    /// deadlock. The whole transaction is gone and may be retried.
    #[error("concurrent write conflict: {0}")]
    Conflict(String),
    #[error("user {0} does not exist")]
    UnknownUser(i64),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl LedgerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }
}

// SQLSTATE codes Postgres uses for losing a race.
const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if let Some(code) = db_err.code() {
                if code == UNIQUE_VIOLATION
                    || code == SERIALIZATION_FAILURE
                    || code == DEADLOCK_DETECTED
                {
                    return LedgerError::Conflict(db_err.message().to_string());
                }
            }
        }
        LedgerError::Database(err)
    }
}
