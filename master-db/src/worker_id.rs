//! Worker identity for claim ownership
//!
//! Every claim, completion, and failure is stamped with the identity of the
//! worker process performing it. The identity is computed once at startup and
//! stays stable for the process's lifetime, so a restarted worker never
//! mistakes another process's lock for its own.

use std::borrow::Cow;

use rand::Rng as _;

/// An owned worker ID for database return values and owned storage scenarios.
pub type WorkerIdOwned = WorkerId<'static>;

/// A worker ID wrapper that provides efficient string handling.
///
/// This _new-type_ wrapper around `Cow<str>` supports both borrowed and owned
/// IDs through copy-on-write semantics.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId<'a>(Cow<'a, str>);

impl<'a> WorkerId<'a> {
    /// Create a new WorkerId wrapper from an owned String
    pub fn from_owned(id: String) -> WorkerIdOwned {
        WorkerId(Cow::Owned(id))
    }

    /// Generate a cluster-unique, process-stable worker identity.
    ///
    /// The identity is formed from the host name, the process id, the process
    /// start timestamp, and a random suffix. Collisions across a cluster are
    /// possible only if two processes on the same host share a pid, start in
    /// the same millisecond, and draw the same 32-bit suffix.
    pub fn generate() -> WorkerIdOwned {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let pid = std::process::id();
        let started_ms = chrono::Utc::now().timestamp_millis();
        let suffix: u32 = rand::rng().random();

        WorkerId::from_owned(format!("{host}-{pid}-{started_ms}-{suffix:08x}"))
    }

    /// Get a reference to the inner str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'a> std::ops::Deref for WorkerId<'a> {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a> AsRef<str> for WorkerId<'a> {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'a> std::fmt::Display for WorkerId<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl<'a> std::fmt::Debug for WorkerId<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl sqlx::Type<sqlx::Postgres> for WorkerId<'_> {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

impl<'a> sqlx::Encode<'_, sqlx::Postgres> for WorkerId<'a> {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'_>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <&str as sqlx::Encode<'_, sqlx::Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for WorkerIdOwned {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <String as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(WorkerId::from_owned(s))
    }
}

impl From<String> for WorkerIdOwned {
    fn from(s: String) -> Self {
        WorkerId::from_owned(s)
    }
}

impl<'a> From<&'a WorkerIdOwned> for WorkerId<'a> {
    fn from(id: &'a WorkerIdOwned) -> Self {
        WorkerId(Cow::Borrowed(id.as_str()))
    }
}
