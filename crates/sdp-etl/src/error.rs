//! ETL engine error types

use thiserror::Error;

/// Result type alias for ETL operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Errors raised by the batch pipeline and its stages
#[derive(Error, Debug)]
pub enum EtlError {
    /// Cannot reach the source, staging, or warehouse system. Fatal for the
    /// affected task; the pipeline aggregates these per task rather than
    /// crashing siblings.
    #[error("Connection to {system} failed: {source}")]
    Connection {
        system: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// The batch control table has no row; nothing can run.
    #[error("No batch available: etl_metadata.batch_control is empty")]
    BatchUnavailable,

    /// A batch number was requested that does not advance the control row.
    #[error("Batch {requested} does not advance the current batch number")]
    NonMonotonicBatch { requested: i64 },

    /// `end_batch` found no open log entry for the batch.
    #[error("Batch {0} has no open log entry")]
    UnknownBatch(i64),

    /// One or more entity extractions failed while others succeeded. The
    /// stage loader must not run against an incomplete batch.
    #[error("Extraction incomplete; failed entities: {}", failed.join(", "))]
    PartialExtraction { failed: Vec<String> },

    /// The bulk-copy primitive reported a failure for one staging table.
    #[error("Bulk load into {table} failed: {source}")]
    BulkLoad {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Object store error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A spawned extraction task was aborted or panicked.
    #[error("Task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Common(#[from] sdp_common::SdpError),
}
