//! SDP ETL engine
//!
//! Batch-controlled incremental load and historization for the sales
//! warehouse. One run moves data through four stores:
//!
//! 1. **Extract**: per-entity deltas (`update_timestamp > batch_date`) are
//!    pulled from the operational source and written as CSV payloads to the
//!    object store.
//! 2. **Stage**: each staging table is truncated and bulk-loaded from the
//!    batch's CSV, giving a clean per-batch snapshot.
//! 3. **Merge / historize**: staged rows are upserted into the warehouse in
//!    foreign-key dependency order; dimensions with tracked attributes gain
//!    Type-2 history versions.
//! 4. **Roll up**: facts are summarized per day and folded additively into
//!    cumulative monthly summaries.
//!
//! Every stage is gated by the singleton batch control row
//! (`etl_metadata.batch_control`), and each run is recorded in the batch log.
//! The [`pipeline::Pipeline`] type owns the stage graph; the individual
//! stages are usable on their own for backfills and repairs.

pub mod batch;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod stage;
pub mod storage;
pub mod warehouse;

pub use batch::{BatchId, BatchRegistry};
pub use config::EtlConfig;
pub use error::{EtlError, Result};
pub use pipeline::Pipeline;
