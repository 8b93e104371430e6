use thiserror::Error;

/// SQLite primary result codes that mean "try again".
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";

/// Error types for persistence operations
#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub(crate) fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }

    /// Lock contention or pool exhaustion; the operation may succeed if repeated.
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::PoolTimedOut) => true,
            StoreError::Database(sqlx::Error::Database(db_err)) => {
                let code = db_err.code();
                let primary = code.as_deref().and_then(|c| {
                    // Extended codes carry the primary code in the low byte.
                    c.parse::<u32>().ok().map(|n| (n & 0xff).to_string())
                });
                matches!(primary.as_deref(), Some(SQLITE_BUSY) | Some(SQLITE_LOCKED))
                    || db_err.message().contains("database is locked")
            }
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::UniqueViolation(db_err.message().to_string())
            }
            _ => StoreError::Database(err),
        }
    }
}
