//! Error types for master/detail store operations

/// Errors that can occur when interacting with the master/detail store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to establish a connection to the store.
    #[error("Error connecting to master db: {0}")]
    Connection(#[source] sqlx::Error),

    /// Failed to run database migrations.
    ///
    /// Migration failures are usually fatal and require manual intervention.
    #[error("Error running migrations: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Database query execution failed.
    ///
    /// Use `is_retryable()` to determine if the error should be retried.
    #[error("Error executing database query: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// Returns `true` if the error is likely to be a transient connection issue.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Returns `true` if the error is retryable.
    ///
    /// This includes both connection errors and transaction-specific errors
    /// that are commonly encountered with `SELECT FOR UPDATE` under
    /// concurrent claimants:
    ///
    /// - **Serialization failures**: two transactions conflicted and one must
    ///   be retried from the beginning.
    /// - **Deadlock detected**: one transaction was aborted to break the cycle.
    pub fn is_retryable(&self) -> bool {
        if self.is_connection_error() {
            return true;
        }

        matches!(
            self,
            Error::Database(sqlx::Error::Database(err))
                if err.code().is_some_and(|code| matches!(
                    code.as_ref(),
                    pg_error_codes::SERIALIZATION_FAILURE | pg_error_codes::DEADLOCK_DETECTED
                ))
        )
    }
}

/// PostgreSQL error codes for transaction-related errors.
///
/// For reference: <https://www.postgresql.org/docs/current/errcodes-appendix.html>
mod pg_error_codes {
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
}
