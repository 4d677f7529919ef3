//! Delimited file sink
//!
//! Frames one output file: a single HEADER line, the streamed DETAIL lines
//! in source order, and a single TRAILER line carrying the aggregates.
//! Writes land in a bounded buffer; `close` flushes and fsyncs. A cycle that
//! does not reach the trailer must delete the partial file on its way out.

use std::{
    io,
    path::{Path, PathBuf},
};

use chrono::NaiveDate;
use master_db::MasterId;
use tokio::{
    fs,
    io::{AsyncWriteExt as _, BufWriter},
};

use crate::{projection::FlatRecord, stats::Totals};

const FIELD_SEPARATOR: char = '|';
const FILE_VERSION: &str = "2.0";
const DATE_FORMAT: &str = "%Y-%m-%d";
const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Buffer size for file writing (32 KiB).
const WRITE_BUFFER_SIZE: usize = 8192 * 4;

/// Compute the output path for a master's file.
///
/// The millisecond timestamp keeps filenames unique across retries of the
/// same master: a re-claimed master never overwrites a previous attempt's
/// file, and two concurrent owners (split-brain across a lock expiry) never
/// target the same name.
pub fn output_path(
    output_directory: &Path,
    business_center_code: &str,
    master_id: MasterId,
) -> PathBuf {
    let tag = chrono::Utc::now().timestamp_millis();
    output_directory.join(format!("{business_center_code}_{master_id}_{tag}.txt"))
}

/// A framed, buffered writer for one output file.
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<fs::File>,
}

impl FileSink {
    /// Create the output file, creating the output directory if needed.
    pub async fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the single HEADER record.
    ///
    /// The header's record count is fixed at 0; the real count is only known
    /// at the end of the stream and goes in the trailer.
    pub async fn write_header(
        &mut self,
        master_id: MasterId,
        business_center_code: &str,
        file_date: NaiveDate,
    ) -> io::Result<()> {
        let line = format!(
            "HEADER|{master_id}|{business_center_code}|{}|0|{FILE_VERSION}",
            file_date.format(DATE_FORMAT),
        );
        self.write_line(&line).await
    }

    /// Write one DETAIL record.
    pub async fn write_detail(&mut self, record: &FlatRecord) -> io::Result<()> {
        let line = detail_line(record);
        self.write_line(&line).await
    }

    /// Write the single TRAILER record.
    pub async fn write_trailer(&mut self, totals: &Totals) -> io::Result<()> {
        let line = format!(
            "TRAILER|{}|{:.2}|{:.2}|{}",
            totals.total_records,
            totals.total_amount,
            totals.average_risk_score,
            totals.unique_customers,
        );
        self.write_line(&line).await
    }

    /// Flush the buffer and fsync the file. Returns the final path.
    pub async fn close(self) -> io::Result<PathBuf> {
        let FileSink { path, mut writer } = self;
        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok(path)
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await
    }
}

/// Best-effort removal of a partial output file. Absence is fine: the cycle
/// may have failed before the file was created.
pub async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => tracing::info!(path = %path.display(), "removed partial output file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove partial output file")
        }
    }
}

fn detail_line(record: &FlatRecord) -> String {
    let transaction_date = record
        .transaction_date
        .map(|date| date.format(DATE_TIME_FORMAT).to_string());

    let fields: [String; 25] = [
        "DETAIL".to_string(),
        record.detail_id.to_string(),
        opt(&record.account_number),
        opt(&record.customer_name),
        opt(&record.amount),
        opt(&record.currency),
        opt(&record.description),
        opt(&transaction_date),
        opt(&record.transaction_id),
        opt(&record.transaction_type),
        opt(&record.customer_id),
        opt(&record.customer_email),
        opt(&record.customer_phone),
        opt(&record.customer_city),
        opt(&record.customer_state),
        opt(&record.customer_country),
        opt(&record.merchant_id),
        opt(&record.merchant_name),
        opt(&record.merchant_category),
        opt(&record.payment_type),
        opt(&record.payment_last_four),
        opt(&record.payment_brand),
        opt(&record.risk_score),
        opt(&record.status),
        opt(&record.item_count),
    ];

    let mut line = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            line.push(FIELD_SEPARATOR);
        }
        line.push_str(field);
    }
    line
}

fn opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}
