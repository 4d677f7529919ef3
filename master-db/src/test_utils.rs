//! Test utilities for database connections and testing

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::warn;

use crate::{Error, MasterDb};

/// Connect to the store with retry logic to handle startup timing issues
///
/// This is specifically designed for tests using pgtemp where PostgreSQL
/// may not be immediately ready to accept connections after startup.
pub async fn connect_with_retry(url: &str, pool_size: u32) -> Result<MasterDb, Error> {
    (|| MasterDb::connect(url, pool_size))
        .retry(test_retry_policy())
        .when(is_database_starting_up)
        .notify(|err, dur| {
            warn!(
                error = %err,
                "Database still starting up during test connection. Retrying in {:.1}s",
                dur.as_secs_f32()
            );
        })
        .await
}

/// Test retry policy: fast initial retries, short max delay, many attempts,
/// since the temp database is expected to come up quickly.
fn test_retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(100))
        .with_max_times(20)
}

/// Check if an [`Error`] is due to database startup
fn is_database_starting_up(err: &Error) -> bool {
    match err {
        Error::Connection(sqlx::Error::Database(db_err)) => db_err
            .to_string()
            .contains("the database system is starting up"),
        _ => false,
    }
}
