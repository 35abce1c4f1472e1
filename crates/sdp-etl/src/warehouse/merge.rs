//! Two-phase warehouse upsert
//!
//! For every entity, staged rows are merged into the warehouse table keyed
//! by the source system's natural key. The update phase must run before the
//! insert phase: update-first means rows already present are refreshed, and
//! the insert phase then only sees natural keys with no warehouse row, so
//! re-merging the same delta can never create duplicates.
//!
//! The SQL for both phases is generated from a per-entity [`MergeSpec`]:
//! identifiers come from the schema description, batch values are always
//! bound as parameters.

use sqlx::PgPool;
use tracing::info;

use crate::batch::BatchId;
use crate::entity::Entity;
use crate::error::Result;

/// Surrogate-key resolution against an already-merged parent table
#[derive(Debug, Clone, Copy)]
pub struct FkLookup {
    /// Fully-qualified parent warehouse table, e.g. `devdw.offices`.
    pub parent_table: &'static str,
    /// Join alias; must not collide with `s` (staging) or `t` (target).
    pub alias: &'static str,
    /// Join condition pairs: (staging column, parent column).
    pub join_on: &'static [(&'static str, &'static str)],
    /// Resolved columns: (warehouse column, parent column).
    pub resolves: &'static [(&'static str, &'static str)],
}

/// Schema description driving one entity's merge SQL
#[derive(Debug, Clone, Copy)]
pub struct MergeSpec {
    pub entity: Entity,
    pub warehouse_table: &'static str,
    /// Natural key columns; composite keys list every column.
    pub natural_key: &'static [&'static str],
    /// Non-key source attributes overwritten on update and copied on insert.
    pub attributes: &'static [&'static str],
    pub lookups: &'static [FkLookup],
    /// Statements run after the insert phase, e.g. self-reference
    /// resolution that needs every row of the entity to exist first.
    pub post_passes: &'static [&'static str],
}

const EMPLOYEE_LOOKUPS: &[FkLookup] = &[FkLookup {
    parent_table: "devdw.offices",
    alias: "o",
    join_on: &[("officecode", "officecode")],
    resolves: &[("dw_office_id", "dw_office_id")],
}];

const CUSTOMER_LOOKUPS: &[FkLookup] = &[FkLookup {
    parent_table: "devdw.employees",
    alias: "e",
    join_on: &[("salesrepemployeenumber", "employeenumber")],
    resolves: &[("dw_sales_rep_employee_id", "dw_employee_id")],
}];

const PRODUCT_LOOKUPS: &[FkLookup] = &[FkLookup {
    parent_table: "devdw.productlines",
    alias: "pl",
    join_on: &[("productline", "productline")],
    resolves: &[("dw_product_line_id", "dw_product_line_id")],
}];

const ORDER_LOOKUPS: &[FkLookup] = &[FkLookup {
    parent_table: "devdw.customers",
    alias: "c",
    join_on: &[("customernumber", "customernumber")],
    resolves: &[("dw_customer_id", "dw_customer_id")],
}];

const ORDER_DETAIL_LOOKUPS: &[FkLookup] = &[
    FkLookup {
        parent_table: "devdw.orders",
        alias: "o",
        join_on: &[("ordernumber", "ordernumber")],
        resolves: &[("dw_order_id", "dw_order_id")],
    },
    FkLookup {
        parent_table: "devdw.products",
        alias: "p",
        join_on: &[("productcode", "productcode")],
        resolves: &[("dw_product_id", "dw_product_id")],
    },
];

const PAYMENT_LOOKUPS: &[FkLookup] = &[FkLookup {
    parent_table: "devdw.customers",
    alias: "c",
    join_on: &[("customernumber", "customernumber")],
    resolves: &[("dw_customer_id", "dw_customer_id")],
}];

/// Resolves the reports-to self-reference once the whole entity is merged.
const EMPLOYEE_REPORTING_PASS: &str = r#"
UPDATE devdw.employees AS e
SET dw_reporting_employee_id = m.dw_employee_id
FROM devdw.employees AS m
WHERE e.reportsto = m.employeenumber
"#;

impl MergeSpec {
    pub fn for_entity(entity: Entity) -> Self {
        match entity {
            Entity::Offices => MergeSpec {
                entity,
                warehouse_table: "devdw.offices",
                natural_key: &["officecode"],
                attributes: &[
                    "city",
                    "phone",
                    "addressline1",
                    "addressline2",
                    "state",
                    "country",
                    "postalcode",
                    "territory",
                ],
                lookups: &[],
                post_passes: &[],
            },
            Entity::Employees => MergeSpec {
                entity,
                warehouse_table: "devdw.employees",
                natural_key: &["employeenumber"],
                attributes: &[
                    "lastname",
                    "firstname",
                    "extension",
                    "email",
                    "officecode",
                    "reportsto",
                    "jobtitle",
                ],
                lookups: EMPLOYEE_LOOKUPS,
                post_passes: &[EMPLOYEE_REPORTING_PASS],
            },
            Entity::Customers => MergeSpec {
                entity,
                warehouse_table: "devdw.customers",
                natural_key: &["customernumber"],
                attributes: &[
                    "customername",
                    "contactlastname",
                    "contactfirstname",
                    "phone",
                    "addressline1",
                    "addressline2",
                    "city",
                    "state",
                    "postalcode",
                    "country",
                    "salesrepemployeenumber",
                    "creditlimit",
                ],
                lookups: CUSTOMER_LOOKUPS,
                post_passes: &[],
            },
            Entity::ProductLines => MergeSpec {
                entity,
                warehouse_table: "devdw.productlines",
                natural_key: &["productline"],
                attributes: &["textdescription"],
                lookups: &[],
                post_passes: &[],
            },
            Entity::Products => MergeSpec {
                entity,
                warehouse_table: "devdw.products",
                natural_key: &["productcode"],
                attributes: &[
                    "productname",
                    "productline",
                    "productscale",
                    "productvendor",
                    "productdescription",
                    "quantityinstock",
                    "buyprice",
                    "msrp",
                ],
                lookups: PRODUCT_LOOKUPS,
                post_passes: &[],
            },
            Entity::Orders => MergeSpec {
                entity,
                warehouse_table: "devdw.orders",
                natural_key: &["ordernumber"],
                attributes: &[
                    "orderdate",
                    "requireddate",
                    "shippeddate",
                    "cancelleddate",
                    "status",
                    "comments",
                    "customernumber",
                ],
                lookups: ORDER_LOOKUPS,
                post_passes: &[],
            },
            Entity::OrderDetails => MergeSpec {
                entity,
                warehouse_table: "devdw.orderdetails",
                natural_key: &["ordernumber", "productcode"],
                attributes: &["quantityordered", "priceeach", "orderlinenumber"],
                lookups: ORDER_DETAIL_LOOKUPS,
                post_passes: &[],
            },
            Entity::Payments => MergeSpec {
                entity,
                warehouse_table: "devdw.payments",
                natural_key: &["customernumber", "checknumber"],
                attributes: &["paymentdate", "amount"],
                lookups: PAYMENT_LOOKUPS,
                post_passes: &[],
            },
        }
    }

    fn lookup_joins(&self) -> String {
        self.lookups
            .iter()
            .map(|l| {
                let conditions = l
                    .join_on
                    .iter()
                    .map(|(stage_col, parent_col)| {
                        format!("{}.{} = s.{}", l.alias, parent_col, stage_col)
                    })
                    .collect::<Vec<_>>()
                    .join(" AND ");
                format!("LEFT JOIN {} AS {} ON {}", l.parent_table, l.alias, conditions)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn key_match(&self, left: &str, right: &str) -> String {
        self.natural_key
            .iter()
            .map(|k| format!("{}.{} = {}.{}", left, k, right, k))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Update phase: refresh every staged row whose natural key already has
    /// a warehouse row, stamping the current batch
    pub fn update_sql(&self) -> String {
        let mut assignments: Vec<String> = self
            .attributes
            .iter()
            .map(|a| format!("{} = s.{}", a, a))
            .collect();

        for lookup in self.lookups {
            for (warehouse_col, parent_col) in lookup.resolves {
                assignments.push(format!("{} = {}.{}", warehouse_col, lookup.alias, parent_col));
            }
        }

        assignments.push("src_update_timestamp = s.update_timestamp".to_string());
        assignments.push("dw_update_timestamp = CURRENT_TIMESTAMP".to_string());
        assignments.push("etl_batch_no = $1".to_string());
        assignments.push("etl_batch_date = $2".to_string());

        let mut sql = format!(
            "UPDATE {} AS t\nSET {}\nFROM {} AS s",
            self.warehouse_table,
            assignments.join(",\n    "),
            self.entity.staging_table()
        );

        let joins = self.lookup_joins();
        if !joins.is_empty() {
            sql.push('\n');
            sql.push_str(&joins);
        }

        sql.push_str(&format!("\nWHERE {}", self.key_match("s", "t")));

        sql
    }

    /// Insert phase: add every staged row whose natural key has no
    /// warehouse row yet
    pub fn insert_sql(&self) -> String {
        let mut target_columns: Vec<String> = self
            .natural_key
            .iter()
            .chain(self.attributes.iter())
            .map(|c| c.to_string())
            .collect();
        let mut select_items: Vec<String> = self
            .natural_key
            .iter()
            .chain(self.attributes.iter())
            .map(|c| format!("s.{}", c))
            .collect();

        for lookup in self.lookups {
            for (warehouse_col, parent_col) in lookup.resolves {
                target_columns.push(warehouse_col.to_string());
                select_items.push(format!("{}.{}", lookup.alias, parent_col));
            }
        }

        target_columns.extend([
            "src_create_timestamp".to_string(),
            "src_update_timestamp".to_string(),
            "etl_batch_no".to_string(),
            "etl_batch_date".to_string(),
        ]);
        select_items.extend([
            "s.create_timestamp".to_string(),
            "s.update_timestamp".to_string(),
            "$1".to_string(),
            "$2".to_string(),
        ]);

        let mut sql = format!(
            "INSERT INTO {}\n    ({})\nSELECT {}\nFROM {} AS s\nLEFT JOIN {} AS t ON {}",
            self.warehouse_table,
            target_columns.join(", "),
            select_items.join(", "),
            self.entity.staging_table(),
            self.warehouse_table,
            self.key_match("s", "t"),
        );

        let joins = self.lookup_joins();
        if !joins.is_empty() {
            sql.push('\n');
            sql.push_str(&joins);
        }

        sql.push_str(&format!("\nWHERE t.{} IS NULL", self.natural_key[0]));

        sql
    }
}

/// Rows touched by one entity's merge
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MergeStats {
    pub updated: u64,
    pub inserted: u64,
}

/// Upserts staged rows into the warehouse in dependency order
pub struct WarehouseMerger {
    warehouse: PgPool,
}

impl WarehouseMerger {
    pub fn new(warehouse: PgPool) -> Self {
        Self { warehouse }
    }

    /// Merge one entity: update phase, insert phase, then any post passes,
    /// all in a single transaction
    pub async fn merge_entity(&self, entity: Entity, batch: BatchId) -> Result<MergeStats> {
        let spec = MergeSpec::for_entity(entity);

        let mut tx = self.warehouse.begin().await?;

        let updated = sqlx::query(&spec.update_sql())
            .bind(batch.batch_no)
            .bind(batch.batch_date)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let inserted = sqlx::query(&spec.insert_sql())
            .bind(batch.batch_no)
            .bind(batch.batch_date)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for pass in spec.post_passes {
            sqlx::query(pass).execute(&mut *tx).await?;
        }

        tx.commit().await?;

        info!(
            entity = %entity,
            batch_no = batch.batch_no,
            updated = updated,
            inserted = inserted,
            "Entity merged into warehouse"
        );

        Ok(MergeStats { updated, inserted })
    }

    /// Merge every entity in foreign-key dependency order
    pub async fn merge_all(&self, batch: BatchId) -> Result<Vec<(Entity, MergeStats)>> {
        let mut results = Vec::with_capacity(Entity::ALL.len());
        for entity in Entity::ALL {
            let stats = self.merge_entity(entity, batch).await?;
            results.push((entity, stats));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offices_update_sql() {
        let sql = MergeSpec::for_entity(Entity::Offices).update_sql();

        assert!(sql.starts_with("UPDATE devdw.offices AS t"));
        assert!(sql.contains("city = s.city"));
        assert!(sql.contains("etl_batch_no = $1"));
        assert!(sql.contains("etl_batch_date = $2"));
        assert!(sql.contains("FROM devstage.offices AS s"));
        assert!(sql.ends_with("WHERE s.officecode = t.officecode"));
        // No lookups for a root entity.
        assert!(!sql.contains("LEFT JOIN devdw"));
    }

    #[test]
    fn test_offices_insert_sql_excludes_existing_keys() {
        let sql = MergeSpec::for_entity(Entity::Offices).insert_sql();

        assert!(sql.starts_with("INSERT INTO devdw.offices"));
        assert!(sql.contains("LEFT JOIN devdw.offices AS t ON s.officecode = t.officecode"));
        assert!(sql.ends_with("WHERE t.officecode IS NULL"));
        assert!(sql.contains("src_create_timestamp"));
    }

    #[test]
    fn test_employees_resolves_office_surrogate() {
        let spec = MergeSpec::for_entity(Entity::Employees);

        let update = spec.update_sql();
        assert!(update.contains("dw_office_id = o.dw_office_id"));
        assert!(update.contains("LEFT JOIN devdw.offices AS o ON o.officecode = s.officecode"));

        // Self-reference pass exists and runs after the insert phase.
        assert_eq!(spec.post_passes.len(), 1);
        assert!(spec.post_passes[0].contains("dw_reporting_employee_id = m.dw_employee_id"));
    }

    #[test]
    fn test_orderdetails_composite_key_and_two_lookups() {
        let spec = MergeSpec::for_entity(Entity::OrderDetails);

        let update = spec.update_sql();
        assert!(update
            .contains("WHERE s.ordernumber = t.ordernumber AND s.productcode = t.productcode"));

        let insert = spec.insert_sql();
        assert!(insert.contains("o.dw_order_id"));
        assert!(insert.contains("p.dw_product_id"));
        assert!(insert.contains(
            "LEFT JOIN devdw.orderdetails AS t ON s.ordernumber = t.ordernumber AND s.productcode = t.productcode"
        ));
        assert!(insert.ends_with("WHERE t.ordernumber IS NULL"));
    }

    #[test]
    fn test_every_entity_has_a_spec_with_batch_binds() {
        for entity in Entity::ALL {
            let spec = MergeSpec::for_entity(entity);
            assert!(spec.update_sql().contains("$1"));
            assert!(spec.update_sql().contains("$2"));
            assert!(spec.insert_sql().contains("$1"));
            assert!(spec.insert_sql().contains("$2"));
        }
    }
}
