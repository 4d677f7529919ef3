//! Detail row streaming
//!
//! Detail rows are read through a server-side cursor on a dedicated
//! connection, so the in-memory working set is bounded by the fetch hint
//! regardless of how many rows a master has. The cursor's transaction is
//! never reused for updates; finalization happens on the pool.

use std::collections::VecDeque;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt as _};
use rust_decimal::Decimal;
use sqlx::{postgres::PgRow, types::chrono::NaiveDateTime, FromRow as _};

use crate::{masters::MasterId, Error, MasterDb};

/// Name of the server-side cursor. The cursor lives on a dedicated
/// connection, so a constant name cannot collide across cycles.
const CURSOR_NAME: &str = "detail_rows";

/// A single detail tuple belonging to one master.
///
/// `transaction_data` is carried as the raw JSON text of the embedded
/// document; deserialization is the projector's concern so that a document
/// that fails to parse does not poison the stream.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DetailRow {
    pub detail_id: i64,
    pub master_id: MasterId,
    pub record_type: Option<String>,
    pub account_number: Option<String>,
    pub customer_name: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub description: Option<String>,
    pub transaction_date: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub transaction_data: Option<String>,
    pub processing_status: Option<String>,
    pub error_message: Option<String>,
}

/// Internal state threaded through the cursor's `try_unfold`-based stream.
///
/// The cursor's transaction is held here (rather than borrowed) so the state
/// can be moved between successive polls without the self-referential borrow
/// that a hand-written generator over `&mut Transaction` would require. The
/// transaction is opened lazily on the first poll.
struct CursorState {
    pool: sqlx::PgPool,
    tx: Option<sqlx::Transaction<'static, sqlx::Postgres>>,
    declare_sql: String,
    fetch_sql: String,
    close_sql: String,
    fetch_size: usize,
    pending: VecDeque<PgRow>,
    declared: bool,
    exhausted: bool,
}

fn declare_cursor<'a>(
    tx: &'a mut sqlx::Transaction<'static, sqlx::Postgres>,
    declare_sql: &'a str,
) -> BoxFuture<'a, Result<(), sqlx::Error>> {
    Box::pin(async move {
        sqlx::raw_sql(declare_sql).execute(&mut **tx).await?;
        Ok(())
    })
}

fn fetch_batch<'a>(
    tx: &'a mut sqlx::Transaction<'static, sqlx::Postgres>,
    fetch_sql: &'a str,
) -> BoxFuture<'a, Result<Vec<PgRow>, sqlx::Error>> {
    Box::pin(async move { sqlx::raw_sql(fetch_sql).fetch_all(&mut **tx).await })
}

fn next_batch<'a>(
    tx: &'a mut sqlx::Transaction<'static, sqlx::Postgres>,
    declare_sql: &'a str,
    fetch_sql: &'a str,
    declared: bool,
) -> BoxFuture<'a, Result<Vec<PgRow>, sqlx::Error>> {
    Box::pin(async move {
        if !declared {
            declare_cursor(tx, declare_sql).await?;
        }
        fetch_batch(tx, fetch_sql).await
    })
}

fn close_and_commit(
    mut tx: sqlx::Transaction<'static, sqlx::Postgres>,
    close_sql: String,
) -> BoxFuture<'static, Result<(), sqlx::Error>> {
    Box::pin(async move {
        sqlx::raw_sql(&close_sql).execute(&mut *tx).await?;
        tx.commit().await
    })
}

fn advance_cursor(
    mut state: CursorState,
) -> BoxFuture<'static, Result<Option<(DetailRow, CursorState)>, Error>> {
    Box::pin(async move {
        loop {
            if let Some(row) = state.pending.pop_front() {
                let detail = DetailRow::from_row(&row)?;
                return Ok(Some((detail, state)));
            }

            if state.exhausted {
                let tx = state.tx.take().expect("transaction present until closed");
                close_and_commit(tx, state.close_sql.clone()).await?;
                return Ok(None);
            }

            let mut tx = match state.tx.take() {
                Some(tx) => tx,
                None => state.pool.begin().await?,
            };
            let batch =
                next_batch(&mut tx, &state.declare_sql, &state.fetch_sql, state.declared).await?;
            state.declared = true;
            state.exhausted = batch.len() < state.fetch_size;
            state.pending = batch.into();
            state.tx = Some(tx);
        }
    })
}

/// Stream the detail rows of a master in ascending `detail_id` order.
///
/// Rows are pulled through a `DECLARE`/`FETCH` cursor in batches of
/// `fetch_hint`, yielded one at a time. The consumer may stop early: dropping
/// the stream returns the connection to the pool, which rolls back the open
/// cursor transaction.
pub fn stream(
    db: &MasterDb,
    master_id: MasterId,
    fetch_hint: usize,
) -> BoxStream<'static, Result<DetailRow, Error>> {
    let pool = db.pool().clone();
    let fetch_size = fetch_hint.max(1);

    // DECLARE is a utility statement and cannot carry bind parameters;
    // the id is an i64 so interpolation is safe.
    let declare_sql = indoc::formatdoc! {r#"
        DECLARE {} NO SCROLL CURSOR FOR
        SELECT detail_id, master_id, record_type, account_number, customer_name,
               amount, currency, description, transaction_date, created_at,
               transaction_data::text AS transaction_data,
               processing_status, error_message
        FROM detail_records
        WHERE master_id = {}
        ORDER BY detail_id ASC
    "#, CURSOR_NAME, master_id.to_i64()};
    let fetch_sql = format!("FETCH {fetch_size} FROM {CURSOR_NAME}");
    let close_sql = format!("CLOSE {CURSOR_NAME}");

    let state = CursorState {
        pool,
        tx: None,
        declare_sql,
        fetch_sql,
        close_sql,
        fetch_size,
        pending: VecDeque::new(),
        declared: false,
        exhausted: false,
    };

    futures::stream::try_unfold(state, advance_cursor).boxed()
}

/// Count the detail rows of a master without loading them.
pub async fn count<'c, E>(exe: E, master_id: MasterId) -> Result<i64, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT COUNT(*)
        FROM detail_records
        WHERE master_id = $1
    "#};
    sqlx::query_scalar(query).bind(master_id).fetch_one(exe).await
}

/// Column values for seeding a detail row.
///
/// Detail rows are normally written by an upstream system; this is used by
/// operational tooling and tests.
#[derive(Debug, Clone, Default)]
pub struct NewDetailRow {
    pub detail_id: i64,
    pub record_type: Option<String>,
    pub account_number: Option<String>,
    pub customer_name: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub description: Option<String>,
    pub transaction_date: Option<NaiveDateTime>,
    pub transaction_data: Option<serde_json::Value>,
}

/// Insert a detail row for a master.
pub async fn insert<'c, E>(
    exe: E,
    master_id: MasterId,
    row: NewDetailRow,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO detail_records (
            detail_id, master_id, record_type, account_number, customer_name,
            amount, currency, description, transaction_date, transaction_data
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    "#};
    sqlx::query(query)
        .bind(row.detail_id)
        .bind(master_id)
        .bind(row.record_type)
        .bind(row.account_number)
        .bind(row.customer_name)
        .bind(row.amount)
        .bind(row.currency)
        .bind(row.description)
        .bind(row.transaction_date)
        .bind(row.transaction_data)
        .execute(exe)
        .await?;
    Ok(())
}
