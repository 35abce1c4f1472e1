//! Type-2 history for dimensions with tracked attributes
//!
//! Each tracked dimension keeps a history table with at most one active
//! version per dimension key. A run closes the active version when the
//! tracked value diverged from the dimension's current value, then opens a
//! fresh active version for every key without one, which covers both the
//! keys just closed and keys seen for the first time. Running the pass again
//! in the same batch with no further change is a no-op.
//!
//! Date ranges never overlap: a closed version ends the day before its
//! successor starts.

use sqlx::PgPool;
use tracing::info;

use crate::batch::BatchId;
use crate::error::Result;

/// One tracked dimension attribute and where its history lives
#[derive(Debug, Clone, Copy)]
pub struct HistorySpec {
    pub name: &'static str,
    pub history_table: &'static str,
    pub dimension_table: &'static str,
    /// Surrogate key column shared by dimension and history tables.
    pub key_column: &'static str,
    /// The attribute whose changes create new versions.
    pub tracked_column: &'static str,
}

impl HistorySpec {
    /// Every historized dimension, in the order the pipeline runs them
    pub const ALL: [HistorySpec; 2] = [
        HistorySpec {
            name: "customer_credit_limit",
            history_table: "devdw.customer_history",
            dimension_table: "devdw.customers",
            key_column: "dw_customer_id",
            tracked_column: "creditlimit",
        },
        HistorySpec {
            name: "product_msrp",
            history_table: "devdw.product_history",
            dimension_table: "devdw.products",
            key_column: "dw_product_id",
            tracked_column: "msrp",
        },
    ];

    /// Close phase: deactivate versions whose tracked value no longer
    /// matches the dimension
    pub fn close_sql(&self) -> String {
        format!(
            r#"UPDATE {history} AS h
SET dw_active_record_ind = 0,
    effective_to_date = ($2::date - INTERVAL '1 day')::date,
    update_etl_batch_no = $1,
    update_etl_batch_date = $2,
    dw_update_timestamp = CURRENT_TIMESTAMP
FROM {dimension} AS d
WHERE h.{key} = d.{key}
  AND h.dw_active_record_ind = 1
  AND d.{tracked} <> h.{tracked}"#,
            history = self.history_table,
            dimension = self.dimension_table,
            key = self.key_column,
            tracked = self.tracked_column,
        )
    }

    /// Open phase: insert an active version for every dimension key that
    /// has none
    pub fn open_sql(&self) -> String {
        format!(
            r#"INSERT INTO {history}
    ({key}, {tracked}, effective_from_date, dw_active_record_ind,
     create_etl_batch_no, create_etl_batch_date)
SELECT d.{key}, d.{tracked}, $2, 1, $1, $2
FROM {dimension} AS d
LEFT JOIN {history} AS h
    ON d.{key} = h.{key} AND h.dw_active_record_ind = 1
WHERE h.{key} IS NULL"#,
            history = self.history_table,
            dimension = self.dimension_table,
            key = self.key_column,
            tracked = self.tracked_column,
        )
    }
}

/// Versions touched by one history pass
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct HistoryStats {
    pub closed: u64,
    pub opened: u64,
}

/// Maintains Type-2 version history for tracked dimensions
pub struct HistoryTracker {
    warehouse: PgPool,
}

impl HistoryTracker {
    pub fn new(warehouse: PgPool) -> Self {
        Self { warehouse }
    }

    /// Run close then open for one dimension, in a single transaction
    pub async fn track(&self, spec: &HistorySpec, batch: BatchId) -> Result<HistoryStats> {
        let mut tx = self.warehouse.begin().await?;

        let closed = sqlx::query(&spec.close_sql())
            .bind(batch.batch_no)
            .bind(batch.batch_date)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let opened = sqlx::query(&spec.open_sql())
            .bind(batch.batch_no)
            .bind(batch.batch_date)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        info!(
            dimension = spec.name,
            batch_no = batch.batch_no,
            closed = closed,
            opened = opened,
            "History pass completed"
        );

        Ok(HistoryStats { closed, opened })
    }

    /// Run every historized dimension in order
    pub async fn track_all(&self, batch: BatchId) -> Result<Vec<(&'static str, HistoryStats)>> {
        let mut results = Vec::with_capacity(HistorySpec::ALL.len());
        for spec in &HistorySpec::ALL {
            let stats = self.track(spec, batch).await?;
            results.push((spec.name, stats));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_sql_targets_only_active_changed_versions() {
        let spec = &HistorySpec::ALL[0];
        let sql = spec.close_sql();

        assert!(sql.starts_with("UPDATE devdw.customer_history AS h"));
        assert!(sql.contains("dw_active_record_ind = 0"));
        assert!(sql.contains("effective_to_date = ($2::date - INTERVAL '1 day')::date"));
        assert!(sql.contains("h.dw_active_record_ind = 1"));
        assert!(sql.contains("d.creditlimit <> h.creditlimit"));
    }

    #[test]
    fn test_open_sql_covers_closed_and_first_seen_keys() {
        let spec = &HistorySpec::ALL[1];
        let sql = spec.open_sql();

        assert!(sql.starts_with("INSERT INTO devdw.product_history"));
        // Anti-join on active versions only: a key whose version was just
        // closed qualifies, as does a key with no history at all.
        assert!(sql.contains("AND h.dw_active_record_ind = 1"));
        assert!(sql.contains("WHERE h.dw_product_id IS NULL"));
        assert!(sql.contains("SELECT d.dw_product_id, d.msrp, $2, 1, $1, $2"));
    }

    #[test]
    fn test_specs_cover_both_tracked_dimensions() {
        let names: Vec<_> = HistorySpec::ALL.iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["customer_credit_limit", "product_msrp"]);
    }
}
