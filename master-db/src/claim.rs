//! Claim engine
//!
//! Composes the master-queue queries into a single atomic claim: find the
//! next best candidate under a `FOR UPDATE SKIP LOCKED` row lock, then take
//! ownership of it in the same transaction. No two workers can observe a
//! successful claim of the same row.

use std::time::Duration;

use sqlx::types::chrono::NaiveDateTime;

use crate::{
    masters::{self, MasterId},
    worker_id::WorkerIdOwned,
    Error, MasterDb,
};

/// Try to claim the next best master for `worker`.
///
/// Returns `None` when there is nothing claimable, when another claimant won
/// the candidate row, or when the transaction failed with a transient error
/// (serialization conflict, deadlock, connection drop). The caller is
/// expected to poll again; transient failures are not worth surfacing.
pub async fn try_claim(
    db: &MasterDb,
    worker: &WorkerIdOwned,
    now: NaiveDateTime,
    lock_horizon: Duration,
) -> Result<Option<MasterId>, Error> {
    match claim_txn(db, worker, now, lock_horizon).await {
        Ok(res) => Ok(res),
        Err(err) if err.is_retryable() => {
            tracing::warn!(worker = %worker, error = %err, "transient error during claim");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

async fn claim_txn(
    db: &MasterDb,
    worker: &WorkerIdOwned,
    now: NaiveDateTime,
    lock_horizon: Duration,
) -> Result<Option<MasterId>, Error> {
    let lock_cutoff = lock_cutoff(now, lock_horizon);

    let mut tx = db.pool().begin().await?;

    let Some(master_id) = masters::find_claimable(&mut *tx, lock_cutoff).await? else {
        tx.commit().await?;
        return Ok(None);
    };

    let claimed = masters::claim(&mut *tx, master_id, worker.into(), now, lock_cutoff).await?;
    tx.commit().await?;

    if claimed {
        tracing::info!(%master_id, worker = %worker, "claimed master");
    } else {
        tracing::debug!(%master_id, worker = %worker, "lost claim race, discarding candidate");
    }

    Ok(claimed.then_some(master_id))
}

/// The instant before which a PROCESSING lock counts as abandoned.
fn lock_cutoff(now: NaiveDateTime, lock_horizon: Duration) -> NaiveDateTime {
    let horizon = chrono::TimeDelta::from_std(lock_horizon).unwrap_or(chrono::TimeDelta::MAX);
    now.checked_sub_signed(horizon).unwrap_or(NaiveDateTime::MIN)
}
