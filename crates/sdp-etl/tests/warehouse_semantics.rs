//! Warehouse semantics tests
//!
//! Exercises the merge, history, and rollup invariants against a real
//! PostgreSQL database:
//!
//! - upsert determinism: merging the same staged delta twice never creates
//!   a second warehouse row for a natural key
//! - single active version and non-overlapping ranges for Type-2 history
//! - monthly summaries stay equal to the sum of their daily rows after
//!   every fold
//! - batch control monotonicity and log lifecycle

use chrono::NaiveDate;
use sqlx::PgPool;

use sdp_etl::batch::{BatchId, BatchRegistry};
use sdp_etl::entity::Entity;
use sdp_etl::error::EtlError;
use sdp_etl::warehouse::{Aggregator, HistorySpec, HistoryTracker, RollupSpec, WarehouseMerger};

fn batch(no: i64, date: &str) -> BatchId {
    BatchId {
        batch_no: no,
        batch_date: date.parse::<NaiveDate>().unwrap(),
    }
}

// ============================================================================
// Batch Registry
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
#[ignore] // Requires database
async fn test_batch_control_lifecycle(pool: PgPool) -> sqlx::Result<()> {
    let registry = BatchRegistry::new(pool);

    // Migration seeds the control row.
    let seeded = registry.current_batch().await.unwrap();
    assert_eq!(seeded.batch_no, 1000);

    // Advancing moves the watermark forward.
    let next = batch(1001, "2024-03-05");
    registry.open_next(next).await.unwrap();
    assert_eq!(registry.current_batch().await.unwrap(), next);

    // A repeated or stale advance is rejected.
    let result = registry.open_next(next).await;
    assert!(matches!(
        result,
        Err(EtlError::NonMonotonicBatch { requested: 1001 })
    ));

    // Start and end bracket one run; start reads the control row.
    let started = registry.start_batch().await.unwrap();
    assert_eq!(started, next);
    registry.end_batch(next.batch_no).await.unwrap();

    // Ending again finds no open log entry.
    let result = registry.end_batch(next.batch_no).await;
    assert!(matches!(result, Err(EtlError::UnknownBatch(1001))));

    Ok(())
}

// ============================================================================
// Warehouse Merge
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
#[ignore] // Requires database
async fn test_merge_same_delta_twice_is_deterministic(pool: PgPool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO devstage.offices
            (officecode, city, country, create_timestamp, update_timestamp)
        VALUES ('7', 'Boston', 'USA', now(), now())
        "#,
    )
    .execute(&pool)
    .await?;

    let merger = WarehouseMerger::new(pool.clone());
    let b = batch(42, "2024-03-05");

    let first = merger.merge_entity(Entity::Offices, b).await.unwrap();
    assert_eq!(first.updated, 0);
    assert_eq!(first.inserted, 1);

    // Insert phase is a no-op the second time because the key now exists.
    let second = merger.merge_entity(Entity::Offices, b).await.unwrap();
    assert_eq!(second.updated, 1);
    assert_eq!(second.inserted, 0);

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM devdw.offices WHERE officecode = '7'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(count, 1);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore] // Requires database
async fn test_merge_resolves_parent_surrogates_and_self_reference(
    pool: PgPool,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO devstage.offices
            (officecode, city, country, create_timestamp, update_timestamp)
        VALUES ('1', 'Paris', 'France', now(), now())
        "#,
    )
    .execute(&pool)
    .await?;

    // A manager and a report in the same delta.
    sqlx::query(
        r#"
        INSERT INTO devstage.employees
            (employeenumber, lastname, officecode, reportsto, create_timestamp, update_timestamp)
        VALUES (1002, 'Murphy', '1', NULL, now(), now()),
               (1056, 'Patterson', '1', 1002, now(), now())
        "#,
    )
    .execute(&pool)
    .await?;

    let merger = WarehouseMerger::new(pool.clone());
    let b = batch(42, "2024-03-05");
    merger.merge_entity(Entity::Offices, b).await.unwrap();
    merger.merge_entity(Entity::Employees, b).await.unwrap();

    let (office_id, reporting_id): (Option<i64>, Option<i64>) = sqlx::query_as(
        r#"
        SELECT e.dw_office_id, e.dw_reporting_employee_id
        FROM devdw.employees e
        WHERE e.employeenumber = 1056
        "#,
    )
    .fetch_one(&pool)
    .await?;

    let manager_id: i64 =
        sqlx::query_scalar("SELECT dw_employee_id FROM devdw.employees WHERE employeenumber = 1002")
            .fetch_one(&pool)
            .await?;

    assert!(office_id.is_some());
    assert_eq!(reporting_id, Some(manager_id));

    Ok(())
}

// ============================================================================
// Type-2 History
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
#[ignore] // Requires database
async fn test_history_versions_tracked_attribute_change(pool: PgPool) -> sqlx::Result<()> {
    let customer_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO devdw.customers (customernumber, creditlimit, etl_batch_no, etl_batch_date)
        VALUES (103, 100, 41, DATE '2024-02-27')
        RETURNING dw_customer_id
        "#,
    )
    .fetch_one(&pool)
    .await?;

    let tracker = HistoryTracker::new(pool.clone());
    let spec = &HistorySpec::ALL[0];

    // First pass opens the initial version.
    let stats = tracker.track(spec, batch(41, "2024-02-27")).await.unwrap();
    assert_eq!(stats.closed, 0);
    assert_eq!(stats.opened, 1);

    // The tracked attribute changes in batch 42.
    sqlx::query("UPDATE devdw.customers SET creditlimit = 150 WHERE dw_customer_id = $1")
        .bind(customer_id)
        .execute(&pool)
        .await?;

    let stats = tracker.track(spec, batch(42, "2024-03-05")).await.unwrap();
    assert_eq!(stats.closed, 1);
    assert_eq!(stats.opened, 1);

    // Prior version is closed the day before the new one opens.
    let closed: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM devdw.customer_history
        WHERE dw_customer_id = $1
          AND dw_active_record_ind = 0
          AND creditlimit = 100
          AND effective_to_date = DATE '2024-03-04'
        "#,
    )
    .bind(customer_id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(closed, 1);

    let active: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM devdw.customer_history
        WHERE dw_customer_id = $1
          AND dw_active_record_ind = 1
          AND creditlimit = 150
          AND effective_from_date = DATE '2024-03-05'
        "#,
    )
    .bind(customer_id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(active, 1);

    // Re-running the same batch with no further change is a no-op.
    let stats = tracker.track(spec, batch(42, "2024-03-05")).await.unwrap();
    assert_eq!(stats.closed, 0);
    assert_eq!(stats.opened, 0);

    // Exactly one active version per key, always.
    let active_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM devdw.customer_history WHERE dw_customer_id = $1 AND dw_active_record_ind = 1",
    )
    .bind(customer_id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(active_count, 1);

    Ok(())
}

// ============================================================================
// Monthly Rollup
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
#[ignore] // Requires database
async fn test_monthly_fold_stays_additive_across_batches(pool: PgPool) -> sqlx::Result<()> {
    let spec = &RollupSpec::ALL[0];
    let aggregator = Aggregator::new(pool.clone());

    // First batch contributes two daily rows for the same month.
    sqlx::query(
        r#"
        INSERT INTO devdw.daily_customer_summary
            (summary_date, dw_customer_id, order_count, order_apd, etl_batch_no, etl_batch_date)
        VALUES (DATE '2024-03-01', 1, 2, 1, 42, DATE '2024-03-01'),
               (DATE '2024-03-02', 1, 1, 1, 42, DATE '2024-03-01')
        "#,
    )
    .execute(&pool)
    .await?;

    let (updated, inserted) = aggregator
        .monthly(spec, batch(42, "2024-03-01"))
        .await
        .unwrap();
    assert_eq!(updated, 0);
    assert_eq!(inserted, 1);

    let order_count: i64 = sqlx::query_scalar(
        "SELECT order_count FROM devdw.monthly_customer_summary WHERE dw_customer_id = 1",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(order_count, 3);

    // Second batch adds one more day; the month row is updated in place.
    sqlx::query(
        r#"
        INSERT INTO devdw.daily_customer_summary
            (summary_date, dw_customer_id, order_count, order_apd, etl_batch_no, etl_batch_date)
        VALUES (DATE '2024-03-03', 1, 1, 1, 43, DATE '2024-03-03')
        "#,
    )
    .execute(&pool)
    .await?;

    let (updated, inserted) = aggregator
        .monthly(spec, batch(43, "2024-03-03"))
        .await
        .unwrap();
    assert_eq!(updated, 1);
    assert_eq!(inserted, 0);

    // Monthly additivity: the month equals the sum of its daily rows.
    let (monthly, daily_sum): (i64, i64) = sqlx::query_as(
        r#"
        SELECT m.order_count,
               (SELECT SUM(d.order_count)::bigint
                FROM devdw.daily_customer_summary d
                WHERE d.dw_customer_id = 1
                  AND date_trunc('month', d.summary_date)::date = m.month_start_date)
        FROM devdw.monthly_customer_summary m
        WHERE m.dw_customer_id = 1
        "#,
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(monthly, 4);
    assert_eq!(monthly, daily_sum);

    // Any-activity flag is set and stays a bit, not a count.
    let order_apm: i32 = sqlx::query_scalar(
        "SELECT order_apm FROM devdw.monthly_customer_summary WHERE dw_customer_id = 1",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(order_apm, 1);

    Ok(())
}
