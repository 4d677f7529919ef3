//! Master work-item queue
//!
//! A master row is the unit of work: one claimed master produces one output
//! file. All mutation goes through owner-checked conditional updates so that
//! N workers can share the table without further coordination.

use sqlx::types::chrono::NaiveDateTime;

use crate::worker_id::{WorkerId, WorkerIdOwned};

/// Find the next best claimable master.
///
/// Returns at most one candidate: a PENDING row, or a PROCESSING row whose
/// lock is older than `lock_cutoff` (abandoned by a crashed worker). Both
/// sets share a single ordering, `(priority DESC, created_at ASC)`, so
/// abandoned work is retried with the same urgency it was seeded with.
///
/// The `FOR UPDATE SKIP LOCKED` row lock is what makes concurrent claimants
/// non-contending: a row selected by one in-flight transaction is invisible
/// to the others.
pub async fn find_claimable<'c, E>(
    exe: E,
    lock_cutoff: NaiveDateTime,
) -> Result<Option<MasterId>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT master_id
        FROM master_records
        WHERE status = $1
           OR (status = $2 AND locked_at < $3)
        ORDER BY priority DESC, created_at ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    "#};
    let res = sqlx::query_scalar(query)
        .bind(MasterStatus::Pending)
        .bind(MasterStatus::Processing)
        .bind(lock_cutoff)
        .fetch_optional(exe)
        .await?;
    Ok(res)
}

/// Conditionally take ownership of a master.
///
/// The row is moved to PROCESSING with `locked_by`/`locked_at` stamped, but
/// only when it is unowned, already owned by this worker, or its existing
/// lock has passed the lock horizon. Returns `true` iff one row was updated;
/// on `false` the caller must discard the candidate and retry.
pub async fn claim<'c, E>(
    exe: E,
    id: MasterId,
    worker: WorkerId<'_>,
    now: NaiveDateTime,
    lock_cutoff: NaiveDateTime,
) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE master_records
        SET status = $2, locked_by = $3, locked_at = $4, updated_at = $4
        WHERE master_id = $1
          AND (locked_by IS NULL OR locked_by = $3 OR locked_at < $5)
    "#};
    let res = sqlx::query(query)
        .bind(id)
        .bind(MasterStatus::Processing)
        .bind(&worker)
        .bind(now)
        .bind(lock_cutoff)
        .execute(exe)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Get a master by its ID
pub async fn get_by_id<'c, E>(exe: E, id: MasterId) -> Result<Option<MasterRecord>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT master_id, business_center_code, priority, status,
               locked_by, locked_at, error_message, created_at, updated_at
        FROM master_records
        WHERE master_id = $1
    "#};
    let res = sqlx::query_as(query).bind(id).fetch_optional(exe).await?;
    Ok(res)
}

/// Mark a master as COMPLETED and clear its lock.
///
/// The update is conditioned on `locked_by = worker`, so a worker whose lock
/// expired and was re-claimed cannot regress the row: the update affects
/// zero rows and `false` is returned.
pub async fn complete<'c, E>(
    exe: E,
    id: MasterId,
    worker: WorkerId<'_>,
    now: NaiveDateTime,
) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE master_records
        SET status = $3, locked_by = NULL, locked_at = NULL, updated_at = $4
        WHERE master_id = $1 AND locked_by = $2
    "#};
    let res = sqlx::query(query)
        .bind(id)
        .bind(&worker)
        .bind(MasterStatus::Completed)
        .bind(now)
        .execute(exe)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Mark a master as FAILED, record the error message, and clear its lock.
///
/// Owner-checked exactly like [`complete`].
pub async fn fail<'c, E>(
    exe: E,
    id: MasterId,
    worker: WorkerId<'_>,
    error_message: &str,
    now: NaiveDateTime,
) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE master_records
        SET status = $3, locked_by = NULL, locked_at = NULL,
            error_message = $4, updated_at = $5
        WHERE master_id = $1 AND locked_by = $2
    "#};
    let res = sqlx::query(query)
        .bind(id)
        .bind(&worker)
        .bind(MasterStatus::Failed)
        .bind(error_message)
        .bind(now)
        .execute(exe)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Insert a new PENDING master.
///
/// Masters are normally seeded by an upstream system; this is used by
/// operational tooling and tests.
pub async fn insert<'c, E>(
    exe: E,
    business_center_code: &str,
    priority: i32,
    created_at: NaiveDateTime,
) -> Result<MasterId, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO master_records (business_center_code, priority, status, created_at)
        VALUES ($1, $2, $3, $4)
        RETURNING master_id
    "#};
    let res = sqlx::query_scalar(query)
        .bind(business_center_code)
        .bind(priority)
        .bind(MasterStatus::Pending)
        .bind(created_at)
        .fetch_one(exe)
        .await?;
    Ok(res)
}

/// Represents a master work item.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MasterRecord {
    /// Unique identifier for the master
    pub master_id: MasterId,

    /// Business center the output file belongs to (the priority key)
    pub business_center_code: String,

    /// Claim priority, higher = sooner
    pub priority: i32,

    /// Current status of the master
    pub status: MasterStatus,

    /// Identity of the worker currently owning the row, if any
    pub locked_by: Option<WorkerIdOwned>,

    /// When the current lock was taken, if any
    pub locked_at: Option<NaiveDateTime>,

    /// Error recorded by the last failed processing attempt
    pub error_message: Option<String>,

    pub created_at: NaiveDateTime,
    pub updated_at: Option<NaiveDateTime>,
}

impl MasterRecord {
    /// Check if the given worker currently owns this master
    pub fn is_owned_by(&self, worker: &WorkerId<'_>) -> bool {
        self.locked_by
            .as_ref()
            .is_some_and(|owner| owner.as_str() == worker.as_str())
    }
}

/// A unique identifier for a master
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    sqlx::Type,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct MasterId(i64);

impl MasterId {
    /// Convert the [`MasterId`] to an `i64`
    pub fn to_i64(self) -> i64 {
        self.0
    }
}

impl AsRef<i64> for MasterId {
    fn as_ref(&self) -> &i64 {
        &self.0
    }
}

impl From<MasterId> for i64 {
    fn from(id: MasterId) -> Self {
        id.0
    }
}

impl From<i64> for MasterId {
    fn from(id: i64) -> Self {
        MasterId(id)
    }
}

impl std::fmt::Display for MasterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents the current status of a master
///
/// The status is stored as a `TEXT` column in the database. If the fetched
/// status is not one of the valid values in the enum, the `UNKNOWN` status is
/// returned.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum MasterStatus {
    /// Master is waiting to be claimed.
    ///
    /// This is the initial state; masters are seeded as PENDING by an
    /// external system.
    #[default]
    Pending,

    /// Master has been claimed by a worker and is being processed.
    ///
    /// A PROCESSING row whose `locked_at` is older than the lock horizon is
    /// considered abandoned and becomes claimable again.
    Processing,

    /// The output file was produced and the master finalized.
    ///
    /// This is a terminal state.
    Completed,

    /// Processing failed; `error_message` carries the cause.
    ///
    /// This is a terminal state. Operators may reset it to PENDING to retry.
    Failed,

    /// Unknown status
    ///
    /// This is an invalid status, and should never happen. Although it is
    /// possible if the worker version differs from the system that seeded
    /// the row.
    Unknown,
}

impl MasterStatus {
    /// Check if the status is terminal
    ///
    /// The worker never transitions a master out of a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Convert the [`MasterStatus`] to a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for MasterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MasterStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Use `eq_ignore_ascii_case` to make the comparison case-insensitive
        match s {
            s if s.eq_ignore_ascii_case("PENDING") => Ok(Self::Pending),
            s if s.eq_ignore_ascii_case("PROCESSING") => Ok(Self::Processing),
            s if s.eq_ignore_ascii_case("COMPLETED") => Ok(Self::Completed),
            s if s.eq_ignore_ascii_case("FAILED") => Ok(Self::Failed),
            _ => Ok(Self::Unknown),
        }
    }
}

impl serde::Serialize for MasterStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for MasterStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: &str = serde::Deserialize::deserialize(deserializer)?;
        // Since FromStr::Err is Infallible, unwrap is safe.
        Ok(s.parse().unwrap())
    }
}

impl sqlx::Type<sqlx::Postgres> for MasterStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("TEXT")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for MasterStatus {
    fn decode(
        value: <sqlx::Postgres as sqlx::Database>::ValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let value: &str = sqlx::Decode::<sqlx::Postgres>::decode(value)?;
        // Since FromStr::Err is Infallible, unwrap is safe.
        Ok(value.parse().unwrap())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for MasterStatus {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        sqlx::Encode::<sqlx::Postgres>::encode_by_ref(&self.as_str(), buf)
    }
}
