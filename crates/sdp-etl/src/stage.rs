//! Staging loads: truncate, then bulk-copy the batch's payload
//!
//! Staging holds only the current batch's delta. Each load is a destructive
//! full-replace: the staging table is truncated unconditionally, then the
//! entity's CSV payload is streamed in through the bulk-copy primitive.
//! There is no atomic swap; a failure mid-load leaves that entity's staging
//! table half-loaded and the run aborted.
//!
//! The copy itself is an external collaborator hidden behind [`BulkLoader`]
//! so the engine never depends on how bytes reach the staging table.

use async_trait::async_trait;
use sqlx::postgres::PgPoolCopyExt;
use sqlx::PgPool;
use tracing::info;

use crate::batch::BatchId;
use crate::entity::Entity;
use crate::error::{EtlError, Result};
use crate::storage::Storage;

/// Bulk-copy primitive: load a CSV object into a staging table
///
/// Implementations must surface failures as errors, never swallow them.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    /// Copy the object at `object_key` into `target_table`, returning the
    /// number of rows loaded. A missing object means the entity had no
    /// delta this batch and loads zero rows.
    async fn copy_csv(
        &self,
        target_table: &str,
        columns: &[&str],
        object_key: &str,
    ) -> Result<u64>;
}

/// Production loader: download from the object store, stream into Postgres
/// `COPY ... FROM STDIN`
pub struct S3CsvLoader {
    warehouse: PgPool,
    storage: Storage,
}

impl S3CsvLoader {
    pub fn new(warehouse: PgPool, storage: Storage) -> Self {
        Self { warehouse, storage }
    }
}

#[async_trait]
impl BulkLoader for S3CsvLoader {
    async fn copy_csv(
        &self,
        target_table: &str,
        columns: &[&str],
        object_key: &str,
    ) -> Result<u64> {
        if !self
            .storage
            .exists(object_key)
            .await
            .map_err(EtlError::Storage)?
        {
            info!(key = object_key, table = target_table, "No payload for this batch, staging stays empty");
            return Ok(0);
        }

        let payload = self
            .storage
            .download(object_key)
            .await
            .map_err(EtlError::Storage)?;

        let statement = copy_statement(target_table, columns);

        let mut copy = self
            .warehouse
            .copy_in_raw(&statement)
            .await
            .map_err(|source| EtlError::BulkLoad {
                table: target_table.to_string(),
                source,
            })?;

        copy.send(payload)
            .await
            .map_err(|source| EtlError::BulkLoad {
                table: target_table.to_string(),
                source,
            })?;

        let rows = copy.finish().await.map_err(|source| EtlError::BulkLoad {
            table: target_table.to_string(),
            source,
        })?;

        Ok(rows)
    }
}

/// Replaces staging snapshots for the current batch
pub struct StageLoader {
    warehouse: PgPool,
    loader: Box<dyn BulkLoader>,
}

impl StageLoader {
    pub fn new(warehouse: PgPool, loader: Box<dyn BulkLoader>) -> Self {
        Self { warehouse, loader }
    }

    /// Truncate and reload one entity's staging table
    pub async fn load_entity(&self, entity: Entity, batch: BatchId) -> Result<u64> {
        let table = entity.staging_table();

        sqlx::query(&format!("TRUNCATE TABLE {}", table))
            .execute(&self.warehouse)
            .await?;

        let key = entity.stage_key(batch.batch_date);
        let rows = self.loader.copy_csv(&table, entity.columns(), &key).await?;

        info!(entity = %entity, batch_no = batch.batch_no, rows = rows, "Staging table reloaded");

        Ok(rows)
    }

    /// Reload every staging table for the batch, sequentially
    pub async fn load_all(&self, batch: BatchId) -> Result<u64> {
        let mut total = 0;
        for entity in Entity::ALL {
            total += self.load_entity(entity, batch).await?;
        }
        Ok(total)
    }
}

/// `COPY` statement for a staging table; header row is part of the payload
/// contract
fn copy_statement(target_table: &str, columns: &[&str]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv, HEADER true)",
        target_table,
        columns.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_statement() {
        let statement = copy_statement("devstage.offices", &["officecode", "city"]);
        assert_eq!(
            statement,
            "COPY devstage.offices (officecode, city) FROM STDIN WITH (FORMAT csv, HEADER true)"
        );
    }
}
