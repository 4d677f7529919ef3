//! Processing coordinator
//!
//! Runs one claim → stream → project → write → finalize cycle. The cursor
//! transaction, the cursor, and the output file are all scoped to the cycle
//! and released on every exit path; a cycle that does not reach the trailer
//! deletes its partial file.

use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use common::Config;
use futures::TryStreamExt as _;
use master_db::{claim, details, masters, MasterDb, MasterId, MasterRecord, WorkerIdOwned};
use tokio_util::sync::CancellationToken;

use crate::{
    projection,
    sink::{self, FileSink},
    stats::FileStats,
};

/// How often to log progress while streaming a master.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// The result of one processing cycle.
#[derive(Debug)]
pub enum Outcome {
    /// A master was claimed and finalized.
    Processed(MasterId),
    /// No claimable master was found.
    Idle,
    /// A master was claimed but the cycle failed.
    Errored(CycleError),
}

/// Errors that terminate a processing cycle.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    /// The master row disappeared between claim and load (external deletion).
    #[error("master {0} vanished after claim")]
    MasterVanished(MasterId),

    /// The store failed: claim, stream, or finalize.
    #[error("store error: {0}")]
    Store(#[from] master_db::Error),

    /// The output file could not be written.
    #[error("sink error: {0}")]
    Sink(#[from] std::io::Error),

    /// The cycle observed shutdown and aborted.
    #[error("cycle cancelled")]
    Cancelled,
}

impl CycleError {
    /// Transient causes are worth backing off and retrying; the rest are
    /// per-master failures already recorded on the row.
    pub fn is_transient(&self) -> bool {
        matches!(self, CycleError::Store(err) if err.is_retryable())
    }
}

/// Per-cycle processing context. One instance is shared by all cycles of a
/// worker process; each cycle is otherwise independent.
#[derive(Clone)]
pub struct Processor {
    db: MasterDb,
    config: Arc<Config>,
    worker: WorkerIdOwned,
}

impl Processor {
    pub fn new(db: MasterDb, config: Arc<Config>, worker: WorkerIdOwned) -> Self {
        Self { db, config, worker }
    }

    pub fn worker_id(&self) -> &WorkerIdOwned {
        &self.worker
    }

    /// Run one processing cycle: claim the next best master, spool its detail
    /// rows to a file, and finalize.
    pub async fn run_one(&self, cancel: &CancellationToken) -> Outcome {
        let now = Utc::now().naive_utc();
        let master_id =
            match claim::try_claim(&self.db, &self.worker, now, self.config.lock_timeout).await {
                Ok(Some(master_id)) => master_id,
                Ok(None) => return Outcome::Idle,
                Err(err) => return Outcome::Errored(err.into()),
            };

        match self.process_claimed(master_id, cancel).await {
            Ok(()) => Outcome::Processed(master_id),
            Err(err) => {
                self.finalize_fail(master_id, &err).await;
                Outcome::Errored(err)
            }
        }
    }

    async fn process_claimed(
        &self,
        master_id: MasterId,
        cancel: &CancellationToken,
    ) -> Result<(), CycleError> {
        let master = masters::get_by_id(self.db.pool(), master_id)
            .await
            .map_err(master_db::Error::from)?
            .ok_or(CycleError::MasterVanished(master_id))?;

        let total_rows = details::count(self.db.pool(), master_id)
            .await
            .map_err(master_db::Error::from)?;
        tracing::info!(
            %master_id,
            business_center = %master.business_center_code,
            total_rows,
            worker = %self.worker,
            "processing master"
        );

        let path = sink::output_path(
            &self.config.output_directory,
            &master.business_center_code,
            master_id,
        );

        let stats = match self.spool(&master, &path, cancel).await {
            Ok(stats) => stats,
            Err(err) => {
                sink::remove_partial(&path).await;
                return Err(err);
            }
        };

        match self.finalize_complete(master_id).await {
            Ok(true) => {
                let totals = stats.totals();
                tracing::info!(
                    %master_id,
                    file = %path.display(),
                    total_records = totals.total_records,
                    unique_customers = totals.unique_customers,
                    "completed master"
                );
                Ok(())
            }
            Ok(false) => {
                // Ownership lost: the lock horizon elapsed mid-cycle and
                // another worker re-claimed the master. The winner produces
                // its own file; ours must not survive.
                tracing::warn!(
                    %master_id,
                    worker = %self.worker,
                    "ownership lost before completion, discarding output file"
                );
                sink::remove_partial(&path).await;
                Ok(())
            }
            Err(err) => {
                // The file is complete but the row stays PROCESSING; lock
                // expiry hands it to another worker, which produces its own
                // file. Downstream consumers must tolerate the duplicate.
                tracing::error!(
                    %master_id,
                    error = %err,
                    "could not finalize completed master, leaving it to lock expiry"
                );
                Ok(())
            }
        }
    }

    /// Stream every detail row of `master` into a freshly created file.
    async fn spool(
        &self,
        master: &MasterRecord,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<FileStats, CycleError> {
        let mut stream = details::stream(&self.db, master.master_id, self.config.batch_size);
        let mut sink = FileSink::create(path).await?;
        let mut stats = FileStats::new();

        sink.write_header(
            master.master_id,
            &master.business_center_code,
            Utc::now().date_naive(),
        )
        .await?;

        let started = Instant::now();
        let mut last_progress = Instant::now();

        while let Some(row) = stream.try_next().await? {
            if cancel.is_cancelled() {
                return Err(CycleError::Cancelled);
            }

            let record = projection::project(row);
            sink.write_detail(&record).await?;
            stats.record(&record);

            if last_progress.elapsed() >= PROGRESS_LOG_INTERVAL {
                let rate = stats.record_count() as f64 / started.elapsed().as_secs_f64();
                tracing::info!(
                    master_id = %master.master_id,
                    rows = stats.record_count(),
                    rows_per_sec = rate as u64,
                    "streaming progress"
                );
                last_progress = Instant::now();
            }
        }

        sink.write_trailer(&stats.totals()).await?;
        sink.close().await?;

        if stats.json_error_count() > 0 {
            tracing::warn!(
                master_id = %master.master_id,
                json_errors = stats.json_error_count(),
                "rows with unparseable embedded documents were written with empty fields"
            );
        }

        Ok(stats)
    }

    /// Mark the master COMPLETED. A transient store error is retried once;
    /// after that the row is left to lock expiry.
    async fn finalize_complete(&self, master_id: MasterId) -> Result<bool, master_db::Error> {
        let result = masters::complete(
            self.db.pool(),
            master_id,
            (&self.worker).into(),
            Utc::now().naive_utc(),
        )
        .await
        .map_err(master_db::Error::from);

        match result {
            Err(err) if err.is_retryable() => {
                tracing::warn!(%master_id, error = %err, "transient error finalizing master, retrying once");
                masters::complete(
                    self.db.pool(),
                    master_id,
                    (&self.worker).into(),
                    Utc::now().naive_utc(),
                )
                .await
                .map_err(master_db::Error::from)
            }
            other => other,
        }
    }

    /// Best-effort: mark the master FAILED with the cycle's error message.
    async fn finalize_fail(&self, master_id: MasterId, cause: &CycleError) {
        let message = cause.to_string();

        let result = masters::fail(
            self.db.pool(),
            master_id,
            (&self.worker).into(),
            &message,
            Utc::now().naive_utc(),
        )
        .await
        .map_err(master_db::Error::from);

        let result = match result {
            Err(err) if err.is_retryable() => {
                tracing::warn!(%master_id, error = %err, "transient error failing master, retrying once");
                masters::fail(
                    self.db.pool(),
                    master_id,
                    (&self.worker).into(),
                    &message,
                    Utc::now().naive_utc(),
                )
                .await
                .map_err(master_db::Error::from)
            }
            other => other,
        };

        match result {
            Ok(true) => {
                tracing::error!(%master_id, error = %message, "failed master");
            }
            Ok(false) => {
                // Another worker already owns (or finalized) the row; its
                // outcome wins and ours exits silently.
                tracing::warn!(%master_id, "ownership lost before failure could be recorded");
            }
            Err(err) => {
                tracing::error!(
                    %master_id,
                    error = %err,
                    "could not record master failure, leaving it to lock expiry"
                );
            }
        }
    }
}
