//! Batch control and batch log
//!
//! The batch control table holds a single row: the current batch number and
//! its date watermark. Every stage of a run reads this row; only
//! [`BatchRegistry::open_next`] mutates it. The batch log is append-only and
//! records one row per run attempt.
//!
//! There is no mutual exclusion between concurrent runs: two `start_batch`
//! calls against the same control row will both succeed and both write a
//! log entry. Operational procedure is expected to serialize runs.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;

use crate::error::{EtlError, Result};

/// The current batch identity: a monotonic number plus its date watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchId {
    pub batch_no: i64,
    pub batch_date: NaiveDate,
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch {} ({})", self.batch_no, self.batch_date)
    }
}

/// Run status recorded in the batch log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Started,
    Completed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &str {
        match self {
            BatchStatus::Started => "S",
            BatchStatus::Completed => "C",
        }
    }
}

impl From<String> for BatchStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "C" => BatchStatus::Completed,
            _ => BatchStatus::Started,
        }
    }
}

/// One row of the batch log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchLogEntry {
    pub batch_no: i64,
    pub batch_date: NaiveDate,
    pub status: BatchStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Owns the batch control row and the batch log
pub struct BatchRegistry {
    warehouse: PgPool,
}

impl BatchRegistry {
    pub fn new(warehouse: PgPool) -> Self {
        Self { warehouse }
    }

    /// Read the current batch from the control table
    ///
    /// Errors with [`EtlError::BatchUnavailable`] if the control row is
    /// missing; every downstream stage depends on it.
    pub async fn current_batch(&self) -> Result<BatchId> {
        let row: Option<(i64, NaiveDate)> = sqlx::query_as(
            "SELECT etl_batch_no, etl_batch_date FROM etl_metadata.batch_control",
        )
        .fetch_optional(&self.warehouse)
        .await?;

        let (batch_no, batch_date) = row.ok_or(EtlError::BatchUnavailable)?;

        Ok(BatchId {
            batch_no,
            batch_date,
        })
    }

    /// Advance the control row to the next batch
    ///
    /// The batch number must strictly increase; the update is guarded so a
    /// stale or repeated advance cannot move the watermark backwards.
    pub async fn open_next(&self, next: BatchId) -> Result<BatchId> {
        let result = sqlx::query(
            r#"
            UPDATE etl_metadata.batch_control
            SET etl_batch_no = $1, etl_batch_date = $2
            WHERE etl_batch_no < $1
            "#,
        )
        .bind(next.batch_no)
        .bind(next.batch_date)
        .execute(&self.warehouse)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish "no control row" from "number did not advance".
            self.current_batch().await?;
            return Err(EtlError::NonMonotonicBatch {
                requested: next.batch_no,
            });
        }

        info!(batch_no = next.batch_no, batch_date = %next.batch_date, "Batch control advanced");

        Ok(next)
    }

    /// Record the start of a run for the current batch
    ///
    /// Reads the control row and appends a `Started` log entry; errors with
    /// [`EtlError::BatchUnavailable`] when the control row is missing.
    pub async fn start_batch(&self) -> Result<BatchId> {
        let batch = self.current_batch().await?;

        sqlx::query(
            r#"
            INSERT INTO etl_metadata.batch_control_log
                (etl_batch_no, etl_batch_date, etl_batch_status, etl_batch_start_time)
            VALUES ($1, $2, $3, NOW())
            "#,
        )
        .bind(batch.batch_no)
        .bind(batch.batch_date)
        .bind(BatchStatus::Started.as_str())
        .execute(&self.warehouse)
        .await?;

        info!(batch_no = batch.batch_no, "Batch started");

        Ok(batch)
    }

    /// Mark the run for `batch_no` as completed
    ///
    /// Only flips a log row that is still `Started`; errors with
    /// [`EtlError::UnknownBatch`] otherwise.
    pub async fn end_batch(&self, batch_no: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE etl_metadata.batch_control_log
            SET etl_batch_status = $1, etl_batch_end_time = NOW()
            WHERE etl_batch_no = $2 AND etl_batch_status = $3
            "#,
        )
        .bind(BatchStatus::Completed.as_str())
        .bind(batch_no)
        .bind(BatchStatus::Started.as_str())
        .execute(&self.warehouse)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EtlError::UnknownBatch(batch_no));
        }

        info!(batch_no = batch_no, "Batch completed");

        Ok(())
    }

    /// Recent batch log entries, newest first
    pub async fn history(&self, limit: i64) -> Result<Vec<BatchLogEntry>> {
        let rows: Vec<(i64, NaiveDate, String, DateTime<Utc>, Option<DateTime<Utc>>)> =
            sqlx::query_as(
                r#"
                SELECT etl_batch_no, etl_batch_date, etl_batch_status,
                       etl_batch_start_time, etl_batch_end_time
                FROM etl_metadata.batch_control_log
                ORDER BY etl_batch_start_time DESC
                LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(&self.warehouse)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(batch_no, batch_date, status, start_time, end_time)| BatchLogEntry {
                batch_no,
                batch_date,
                status: status.into(),
                start_time,
                end_time,
            })
            .collect())
    }
}
