//! Daily and monthly fact summaries
//!
//! The daily pass inserts one fresh row per (date, key) touched by the
//! batch window. Each measure group (orders placed, cancelled, shipped,
//! payments, new customers) contributes a sparse partial row; partials for
//! the same (date, key) are reduced by taking the per-column MAX, which is
//! safe because the groups never overlap: exactly one group produces a
//! non-zero value for any column. The pass is not idempotent on its own;
//! the pipeline guarantees at-most-once execution per batch.
//!
//! The monthly pass folds the batch window's daily rows into their owning
//! months: existing month rows are updated additively (counters and amounts
//! added, `*_apm` any-activity flags OR-ed), missing months are inserted.
//! Monthly summaries are therefore running totals across batches while
//! daily summaries stay per-batch snapshots.

use sqlx::PgPool;
use tracing::info;

use crate::batch::BatchId;
use crate::error::Result;

/// Daily insert for the customer summary: five measure groups reduced by MAX
const DAILY_CUSTOMER_SQL: &str = r#"
INSERT INTO devdw.daily_customer_summary
    (summary_date, dw_customer_id,
     order_count, order_apd, order_amount, order_cost_amount, order_mrp_amount,
     products_ordered_qty, products_items_qty,
     cancelled_order_count, cancelled_order_amount, cancelled_order_apd,
     shipped_order_count, shipped_order_amount, shipped_order_apd,
     payment_apd, payment_amount, new_customer_apd,
     etl_batch_no, etl_batch_date)
WITH measures AS (
    -- Orders placed
    SELECT o.orderdate AS summary_date,
           o.dw_customer_id,
           COUNT(DISTINCT o.dw_order_id) AS order_count,
           1 AS order_apd,
           SUM(od.priceeach * od.quantityordered) AS order_amount,
           SUM(p.buyprice * od.quantityordered) AS order_cost_amount,
           SUM(p.msrp * od.quantityordered) AS order_mrp_amount,
           COUNT(DISTINCT od.productcode) AS products_ordered_qty,
           SUM(od.quantityordered) AS products_items_qty,
           0 AS cancelled_order_count, 0 AS cancelled_order_amount, 0 AS cancelled_order_apd,
           0 AS shipped_order_count, 0 AS shipped_order_amount, 0 AS shipped_order_apd,
           0 AS payment_apd, 0 AS payment_amount, 0 AS new_customer_apd
    FROM devdw.orders AS o
    JOIN devdw.orderdetails AS od ON o.dw_order_id = od.dw_order_id
    JOIN devdw.products AS p ON od.dw_product_id = p.dw_product_id
    WHERE o.orderdate >= $2
    GROUP BY o.orderdate, o.dw_customer_id

    UNION ALL

    -- Orders cancelled
    SELECT o.cancelleddate,
           o.dw_customer_id,
           0, 0, 0, 0, 0, 0, 0,
           COUNT(DISTINCT o.dw_order_id),
           SUM(od.priceeach * od.quantityordered),
           1,
           0, 0, 0,
           0, 0, 0
    FROM devdw.orders AS o
    JOIN devdw.orderdetails AS od ON o.dw_order_id = od.dw_order_id
    WHERE o.cancelleddate >= $2
    GROUP BY o.cancelleddate, o.dw_customer_id

    UNION ALL

    -- Orders shipped
    SELECT o.shippeddate,
           o.dw_customer_id,
           0, 0, 0, 0, 0, 0, 0,
           0, 0, 0,
           COUNT(DISTINCT o.dw_order_id),
           SUM(od.priceeach * od.quantityordered),
           1,
           0, 0, 0
    FROM devdw.orders AS o
    JOIN devdw.orderdetails AS od ON o.dw_order_id = od.dw_order_id
    WHERE o.shippeddate >= $2
      AND o.status = 'Shipped'
    GROUP BY o.shippeddate, o.dw_customer_id

    UNION ALL

    -- Payments received
    SELECT pay.paymentdate,
           pay.dw_customer_id,
           0, 0, 0, 0, 0, 0, 0,
           0, 0, 0,
           0, 0, 0,
           1,
           SUM(pay.amount),
           0
    FROM devdw.payments AS pay
    WHERE pay.paymentdate >= $2
    GROUP BY pay.paymentdate, pay.dw_customer_id

    UNION ALL

    -- New customers
    SELECT c.src_create_timestamp::date,
           c.dw_customer_id,
           0, 0, 0, 0, 0, 0, 0,
           0, 0, 0,
           0, 0, 0,
           0, 0,
           1
    FROM devdw.customers AS c
    WHERE c.src_create_timestamp >= $2
)
SELECT summary_date,
       dw_customer_id,
       MAX(order_count), MAX(order_apd), MAX(order_amount),
       MAX(order_cost_amount), MAX(order_mrp_amount),
       MAX(products_ordered_qty), MAX(products_items_qty),
       MAX(cancelled_order_count), MAX(cancelled_order_amount), MAX(cancelled_order_apd),
       MAX(shipped_order_count), MAX(shipped_order_amount), MAX(shipped_order_apd),
       MAX(payment_apd), MAX(payment_amount), MAX(new_customer_apd),
       $1, $2
FROM measures
GROUP BY summary_date, dw_customer_id
"#;

/// Daily insert for the product summary: placed and cancelled order groups
const DAILY_PRODUCT_SQL: &str = r#"
INSERT INTO devdw.daily_product_summary
    (summary_date, dw_product_id,
     order_apd, order_cost_amount, order_mrp_amount,
     cancelled_order_qty, cancelled_cost_amount, cancelled_mrp_amount,
     cancelled_order_apd,
     etl_batch_no, etl_batch_date)
WITH measures AS (
    -- Orders placed
    SELECT o.orderdate AS summary_date,
           od.dw_product_id,
           1 AS order_apd,
           SUM(od.quantityordered * od.priceeach) AS order_cost_amount,
           SUM(od.quantityordered * p.msrp) AS order_mrp_amount,
           0 AS cancelled_order_qty, 0 AS cancelled_cost_amount,
           0 AS cancelled_mrp_amount, 0 AS cancelled_order_apd
    FROM devdw.orderdetails AS od
    JOIN devdw.orders AS o ON od.dw_order_id = o.dw_order_id
    JOIN devdw.products AS p ON od.dw_product_id = p.dw_product_id
    WHERE o.orderdate >= $2
    GROUP BY o.orderdate, od.dw_product_id

    UNION ALL

    -- Orders cancelled
    SELECT o.cancelleddate,
           od.dw_product_id,
           0, 0, 0,
           COUNT(DISTINCT od.dw_order_id),
           SUM(od.quantityordered * od.priceeach),
           SUM(od.quantityordered * p.msrp),
           1
    FROM devdw.orderdetails AS od
    JOIN devdw.orders AS o ON od.dw_order_id = o.dw_order_id
    JOIN devdw.products AS p ON od.dw_product_id = p.dw_product_id
    WHERE o.cancelleddate >= $2
    GROUP BY o.cancelleddate, od.dw_product_id
)
SELECT summary_date,
       dw_product_id,
       MAX(order_apd), MAX(order_cost_amount), MAX(order_mrp_amount),
       MAX(cancelled_order_qty), MAX(cancelled_cost_amount), MAX(cancelled_mrp_amount),
       MAX(cancelled_order_apd),
       $1, $2
FROM measures
GROUP BY summary_date, dw_product_id
"#;

/// Schema description for one summary pair (daily table + monthly fold)
#[derive(Debug, Clone, Copy)]
pub struct RollupSpec {
    pub name: &'static str,
    pub daily_table: &'static str,
    pub monthly_table: &'static str,
    pub key_column: &'static str,
    /// Additive columns, summed per month and added into existing rows.
    pub counters: &'static [&'static str],
    /// (daily activity column, monthly any-activity column) pairs; the
    /// monthly column is OR-combined across batches.
    pub flags: &'static [(&'static str, &'static str)],
    pub daily_sql: &'static str,
}

impl RollupSpec {
    /// Every summary pair, in the order the pipeline runs them
    pub const ALL: [RollupSpec; 2] = [
        RollupSpec {
            name: "customer_summary",
            daily_table: "devdw.daily_customer_summary",
            monthly_table: "devdw.monthly_customer_summary",
            key_column: "dw_customer_id",
            counters: &[
                "order_count",
                "order_apd",
                "order_amount",
                "order_cost_amount",
                "order_mrp_amount",
                "products_ordered_qty",
                "products_items_qty",
                "cancelled_order_count",
                "cancelled_order_amount",
                "cancelled_order_apd",
                "shipped_order_count",
                "shipped_order_amount",
                "shipped_order_apd",
                "payment_apd",
                "payment_amount",
                "new_customer_apd",
            ],
            flags: &[
                ("order_apd", "order_apm"),
                ("cancelled_order_apd", "cancelled_order_apm"),
                ("shipped_order_apd", "shipped_order_apm"),
                ("payment_apd", "payment_apm"),
                ("new_customer_apd", "new_customer_apm"),
            ],
            daily_sql: DAILY_CUSTOMER_SQL,
        },
        RollupSpec {
            name: "product_summary",
            daily_table: "devdw.daily_product_summary",
            monthly_table: "devdw.monthly_product_summary",
            key_column: "dw_product_id",
            counters: &[
                "order_apd",
                "order_cost_amount",
                "order_mrp_amount",
                "cancelled_order_qty",
                "cancelled_cost_amount",
                "cancelled_mrp_amount",
                "cancelled_order_apd",
            ],
            flags: &[
                ("order_apd", "order_apm"),
                ("cancelled_order_apd", "cancelled_order_apm"),
            ],
            daily_sql: DAILY_PRODUCT_SQL,
        },
    ];

    /// Aggregate the batch window's daily rows per owning month
    fn month_delta_cte(&self) -> String {
        let mut items: Vec<String> = self
            .counters
            .iter()
            .map(|c| format!("SUM(d.{}) AS {}", c, c))
            .collect();

        for (daily, monthly) in self.flags {
            items.push(format!(
                "CASE WHEN SUM(d.{}) > 0 THEN 1 ELSE 0 END AS {}",
                daily, monthly
            ));
        }

        format!(
            r#"WITH month_delta AS (
    SELECT date_trunc('month', d.summary_date)::date AS month_start_date,
           d.{key},
           {items}
    FROM {daily} AS d
    WHERE d.summary_date >= $2
    GROUP BY date_trunc('month', d.summary_date)::date, d.{key}
)"#,
            key = self.key_column,
            items = items.join(",\n           "),
            daily = self.daily_table,
        )
    }

    /// Fold the batch window into months that already have a row
    pub fn monthly_update_sql(&self) -> String {
        let mut assignments: Vec<String> = self
            .counters
            .iter()
            .map(|c| format!("{} = m.{} + c.{}", c, c, c))
            .collect();

        for (_, monthly) in self.flags {
            assignments.push(format!("{} = (m.{} | c.{})", monthly, monthly, monthly));
        }

        assignments.push("dw_update_timestamp = CURRENT_TIMESTAMP".to_string());
        assignments.push("etl_batch_no = $1".to_string());
        assignments.push("etl_batch_date = $2".to_string());

        format!(
            r#"{cte}
UPDATE {monthly} AS m
SET {assignments}
FROM month_delta AS c
WHERE m.month_start_date = c.month_start_date
  AND m.{key} = c.{key}"#,
            cte = self.month_delta_cte(),
            monthly = self.monthly_table,
            assignments = assignments.join(",\n    "),
            key = self.key_column,
        )
    }

    /// Insert fresh rows for months with no prior summary
    pub fn monthly_insert_sql(&self) -> String {
        let mut columns: Vec<String> = vec![
            "month_start_date".to_string(),
            self.key_column.to_string(),
        ];
        columns.extend(self.counters.iter().map(|c| c.to_string()));
        columns.extend(self.flags.iter().map(|(_, m)| m.to_string()));
        columns.push("etl_batch_no".to_string());
        columns.push("etl_batch_date".to_string());

        let mut select_items: Vec<String> = vec![
            "c.month_start_date".to_string(),
            format!("c.{}", self.key_column),
        ];
        select_items.extend(self.counters.iter().map(|c| format!("c.{}", c)));
        select_items.extend(self.flags.iter().map(|(_, m)| format!("c.{}", m)));
        select_items.push("$1".to_string());
        select_items.push("$2".to_string());

        format!(
            r#"INSERT INTO {monthly}
    ({columns})
{cte}
SELECT {select_items}
FROM month_delta AS c
LEFT JOIN {monthly} AS m
    ON m.month_start_date = c.month_start_date AND m.{key} = c.{key}
WHERE m.{key} IS NULL"#,
            monthly = self.monthly_table,
            columns = columns.join(", "),
            cte = self.month_delta_cte(),
            select_items = select_items.join(", "),
            key = self.key_column,
        )
    }
}

/// Rows touched by one summary's rollup
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RollupStats {
    pub daily_rows: u64,
    pub monthly_updated: u64,
    pub monthly_inserted: u64,
}

/// Computes daily summaries and folds them into monthly totals
pub struct Aggregator {
    warehouse: PgPool,
}

impl Aggregator {
    pub fn new(warehouse: PgPool) -> Self {
        Self { warehouse }
    }

    /// Insert the batch window's daily rows for one summary
    pub async fn daily(&self, spec: &RollupSpec, batch: BatchId) -> Result<u64> {
        let rows = sqlx::query(spec.daily_sql)
            .bind(batch.batch_no)
            .bind(batch.batch_date)
            .execute(&self.warehouse)
            .await?
            .rows_affected();

        info!(
            summary = spec.name,
            batch_no = batch.batch_no,
            rows = rows,
            "Daily summary computed"
        );

        Ok(rows)
    }

    /// Fold the batch window into one summary's monthly rows: update
    /// existing months, then insert missing ones, in a single transaction
    pub async fn monthly(&self, spec: &RollupSpec, batch: BatchId) -> Result<(u64, u64)> {
        let mut tx = self.warehouse.begin().await?;

        let updated = sqlx::query(&spec.monthly_update_sql())
            .bind(batch.batch_no)
            .bind(batch.batch_date)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let inserted = sqlx::query(&spec.monthly_insert_sql())
            .bind(batch.batch_no)
            .bind(batch.batch_date)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        info!(
            summary = spec.name,
            batch_no = batch.batch_no,
            updated = updated,
            inserted = inserted,
            "Monthly summary folded"
        );

        Ok((updated, inserted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monthly_update_adds_and_ors() {
        let spec = &RollupSpec::ALL[0];
        let sql = spec.monthly_update_sql();

        assert!(sql.contains("order_count = m.order_count + c.order_count"));
        assert!(sql.contains("payment_amount = m.payment_amount + c.payment_amount"));
        assert!(sql.contains("order_apm = (m.order_apm | c.order_apm)"));
        assert!(sql.contains("new_customer_apm = (m.new_customer_apm | c.new_customer_apm)"));
        assert!(sql.contains("WHERE m.month_start_date = c.month_start_date"));
        assert!(sql.contains("AND m.dw_customer_id = c.dw_customer_id"));
    }

    #[test]
    fn test_monthly_insert_anti_joins_existing_months() {
        let spec = &RollupSpec::ALL[1];
        let sql = spec.monthly_insert_sql();

        assert!(sql.starts_with("INSERT INTO devdw.monthly_product_summary"));
        assert!(sql.contains("LEFT JOIN devdw.monthly_product_summary AS m"));
        assert!(sql.ends_with("WHERE m.dw_product_id IS NULL"));
        // Flags materialize as any-activity bits on first insert too.
        assert!(sql.contains("CASE WHEN SUM(d.order_apd) > 0 THEN 1 ELSE 0 END AS order_apm"));
    }

    #[test]
    fn test_month_delta_buckets_by_month_start() {
        let spec = &RollupSpec::ALL[0];
        let cte = spec.month_delta_cte();

        assert!(cte.contains("date_trunc('month', d.summary_date)::date AS month_start_date"));
        assert!(cte.contains("WHERE d.summary_date >= $2"));
    }

    #[test]
    fn test_daily_sql_reduces_partials_by_max() {
        for spec in &RollupSpec::ALL {
            assert!(spec.daily_sql.contains("UNION ALL"));
            assert!(spec.daily_sql.contains("MAX("));
            assert!(spec.daily_sql.contains("GROUP BY summary_date"));
        }
    }

    #[test]
    fn test_daily_customer_measure_groups() {
        assert!(DAILY_CUSTOMER_SQL.contains("WHERE o.orderdate >= $2"));
        assert!(DAILY_CUSTOMER_SQL.contains("WHERE o.cancelleddate >= $2"));
        assert!(DAILY_CUSTOMER_SQL.contains("AND o.status = 'Shipped'"));
        assert!(DAILY_CUSTOMER_SQL.contains("WHERE pay.paymentdate >= $2"));
        assert!(DAILY_CUSTOMER_SQL.contains("WHERE c.src_create_timestamp >= $2"));
    }
}
