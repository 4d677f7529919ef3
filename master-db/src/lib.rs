//! Postgres layer for the master/detail store.
//!
//! The database is the cluster coordinator: every worker process claims,
//! streams, and finalizes masters exclusively through the conditional
//! queries in this crate.

use std::time::Duration;

use sqlx::{migrate::Migrator, postgres::PgPoolOptions, Pool, Postgres};

pub mod claim;
pub mod details;
mod error;
pub mod masters;
pub mod test_utils;
mod worker_id;

pub use self::{
    claim::try_claim,
    details::DetailRow,
    error::Error,
    masters::{MasterId, MasterRecord, MasterStatus},
    worker_id::{WorkerId, WorkerIdOwned},
};

static MIGRATOR: Migrator = sqlx::migrate!();

/// A connection pool to the master/detail store.
#[derive(Clone)]
pub struct MasterDb {
    pool: Pool<Postgres>,
}

impl MasterDb {
    /// Sets up a connection pool to the store. Runs migrations if necessary.
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(Error::Connection)?;
        let db = MasterDb { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// The default pool size when none is configured.
    pub fn default_pool_size() -> u32 {
        10
    }

    /// sqlx does the right things:
    /// - Locks the DB before running migrations.
    /// - Never runs the same migration twice.
    /// - Errors on changes to old migrations.
    async fn run_migrations(&self) -> Result<(), Error> {
        MIGRATOR.run(&self.pool).await.map_err(Error::Migration)
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}
