//! Warehouse-side stages: merge, historization, rollups
//!
//! Everything in this module runs against the warehouse pool in the fixed
//! entity dependency order. Each unit of work (one entity's merge, one
//! dimension's history pass, one summary's rollup) is a single transaction:
//! it commits only if every statement succeeds, otherwise the whole unit
//! rolls back. There is no cross-unit transaction.

pub mod history;
pub mod merge;
pub mod rollup;

pub use history::{HistorySpec, HistoryStats, HistoryTracker};
pub use merge::{MergeSpec, MergeStats, WarehouseMerger};
pub use rollup::{Aggregator, RollupSpec, RollupStats};
