//! The six-stage batch pipeline
//!
//! Explicit task graph for one run:
//!
//! ```text
//! start batch ─▶ extract (parallel, bounded) ─▶ stage load (sequential)
//!    ─▶ merge (dependency order) ─▶ history ─▶ daily rollup
//!    ─▶ monthly rollup ─▶ end batch
//! ```
//!
//! Stage boundaries are barriers: a stage does not begin until every task of
//! the prior stage has returned. Extraction failures never abort sibling
//! tasks, but staging is gated on all extracts having succeeded: an
//! incomplete batch aborts the run before it can reach the warehouse.
//! Sequential stage units retry up to `max_retries` times; an exhausted
//! unit aborts everything that remains. The batch log entry then stays
//! `Started`, which is the operator's signal to investigate and re-run.

use serde::Serialize;
use sqlx::PgPool;
use std::future::Future;
use tracing::{error, info, warn};

use crate::batch::{BatchId, BatchRegistry};
use crate::config::PipelineConfig;
use crate::entity::Entity;
use crate::error::{EtlError, Result};
use crate::extract::Extractor;
use crate::stage::{S3CsvLoader, StageLoader};
use crate::storage::Storage;
use crate::warehouse::{
    Aggregator, HistorySpec, HistoryStats, HistoryTracker, MergeStats, RollupSpec, RollupStats,
    WarehouseMerger,
};

/// Outcome of one extraction task
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub entity: Entity,
    pub rows: u64,
    pub object_key: Option<String>,
    pub error: Option<String>,
}

/// Everything a completed run touched
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub batch: BatchId,
    pub extracted: Vec<TaskReport>,
    pub staged_rows: u64,
    pub merged: Vec<(String, MergeStats)>,
    pub history: Vec<(String, HistoryStats)>,
    pub rollups: Vec<(String, RollupStats)>,
}

/// Owns the stage graph for a batch run
pub struct Pipeline {
    config: PipelineConfig,
    source: PgPool,
    warehouse: PgPool,
    storage: Storage,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        source: PgPool,
        warehouse: PgPool,
        storage: Storage,
    ) -> Self {
        Self {
            config,
            source,
            warehouse,
            storage,
        }
    }

    /// Run the full pipeline for the current batch
    ///
    /// The batch registry read and the start-log write are the mandatory
    /// setup: failure there halts immediately. Downstream stage failures
    /// abort the remaining stages and leave the log entry `Started`.
    pub async fn run(&self) -> Result<RunReport> {
        let registry = BatchRegistry::new(self.warehouse.clone());

        let batch = registry.start_batch().await?;

        info!(batch_no = batch.batch_no, batch_date = %batch.batch_date, "Pipeline run started");

        self.storage
            .ensure_bucket()
            .await
            .map_err(EtlError::Storage)?;

        let extracted = self.extract_stage(batch).await?;
        let staged_rows = self.staging_stage(batch).await?;
        let merged = self.merge_stage(batch).await?;
        let history = self.history_stage(batch).await?;
        let rollups = self.rollup_stage(batch).await?;

        registry.end_batch(batch.batch_no).await?;

        info!(
            batch_no = batch.batch_no,
            staged_rows = staged_rows,
            "Pipeline run completed"
        );

        Ok(RunReport {
            batch,
            extracted,
            staged_rows,
            merged,
            history,
            rollups,
        })
    }

    /// Extract every entity in parallel, then gate on full success
    async fn extract_stage(&self, batch: BatchId) -> Result<Vec<TaskReport>> {
        let extractor = Extractor::new(self.source.clone(), self.storage.clone());
        let results = extractor
            .extract_all(batch, self.config.max_concurrency)
            .await;

        let mut reports = Vec::with_capacity(results.len());
        let mut failed = Vec::new();

        for (entity, result) in results {
            match result {
                Ok(report) => reports.push(TaskReport {
                    entity,
                    rows: report.rows,
                    object_key: report.object_key,
                    error: None,
                }),
                Err(e) => {
                    failed.push(entity.name().to_string());
                    reports.push(TaskReport {
                        entity,
                        rows: 0,
                        object_key: None,
                        error: Some(e.to_string()),
                    });
                },
            }
        }

        if !failed.is_empty() {
            error!(
                failed = ?failed,
                "Extraction incomplete, aborting before staging"
            );
            return Err(EtlError::PartialExtraction { failed });
        }

        Ok(reports)
    }

    /// Truncate and reload every staging table, sequentially
    async fn staging_stage(&self, batch: BatchId) -> Result<u64> {
        let loader = StageLoader::new(
            self.warehouse.clone(),
            Box::new(S3CsvLoader::new(
                self.warehouse.clone(),
                self.storage.clone(),
            )),
        );

        let mut total = 0;
        for entity in Entity::ALL {
            total += with_retries(self.config.max_retries, entity.name(), || {
                loader.load_entity(entity, batch)
            })
            .await?;
        }

        Ok(total)
    }

    /// Upsert staged rows into the warehouse in dependency order
    async fn merge_stage(&self, batch: BatchId) -> Result<Vec<(String, MergeStats)>> {
        let merger = WarehouseMerger::new(self.warehouse.clone());

        let mut merged = Vec::with_capacity(Entity::ALL.len());
        for entity in Entity::ALL {
            let stats = with_retries(self.config.max_retries, entity.name(), || {
                merger.merge_entity(entity, batch)
            })
            .await?;
            merged.push((entity.name().to_string(), stats));
        }

        Ok(merged)
    }

    /// Version tracked dimension attributes
    async fn history_stage(&self, batch: BatchId) -> Result<Vec<(String, HistoryStats)>> {
        let tracker = HistoryTracker::new(self.warehouse.clone());

        let mut history = Vec::with_capacity(HistorySpec::ALL.len());
        for spec in &HistorySpec::ALL {
            let stats =
                with_retries(self.config.max_retries, spec.name, || tracker.track(spec, batch))
                    .await?;
            history.push((spec.name.to_string(), stats));
        }

        Ok(history)
    }

    /// Daily summaries for the batch window, then the monthly fold
    async fn rollup_stage(&self, batch: BatchId) -> Result<Vec<(String, RollupStats)>> {
        let aggregator = Aggregator::new(self.warehouse.clone());

        let mut rollups: Vec<(String, RollupStats)> = Vec::with_capacity(RollupSpec::ALL.len());

        for spec in &RollupSpec::ALL {
            let daily_rows =
                with_retries(self.config.max_retries, spec.name, || {
                    aggregator.daily(spec, batch)
                })
                .await?;
            rollups.push((
                spec.name.to_string(),
                RollupStats {
                    daily_rows,
                    ..Default::default()
                },
            ));
        }

        for (i, spec) in RollupSpec::ALL.iter().enumerate() {
            let (monthly_updated, monthly_inserted) =
                with_retries(self.config.max_retries, spec.name, || {
                    aggregator.monthly(spec, batch)
                })
                .await?;
            rollups[i].1.monthly_updated = monthly_updated;
            rollups[i].1.monthly_inserted = monthly_inserted;
        }

        Ok(rollups)
    }
}

/// Retry a stage unit of work up to `max_retries` times before giving up
async fn with_retries<T, F, Fut>(max_retries: u32, unit: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                warn!(
                    unit = unit,
                    attempt = attempt,
                    max_retries = max_retries,
                    error = %e,
                    "Stage unit failed, retrying"
                );
            },
            Err(e) => {
                error!(unit = unit, error = %e, "Stage unit failed after retries, aborting run");
                return Err(e);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_with_retries_recovers_within_budget() {
        let attempts = Cell::new(0);

        let result = with_retries(2, "flaky", || {
            let n = attempts.get() + 1;
            attempts.set(n);
            async move {
                if n < 3 {
                    Err(EtlError::Task("transient".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.get(), 3);
    }

    #[tokio::test]
    async fn test_with_retries_gives_up_after_budget() {
        let attempts = Cell::new(0);

        let result: Result<()> = with_retries(1, "broken", || {
            attempts.set(attempts.get() + 1);
            async { Err(EtlError::Task("permanent".to_string())) }
        })
        .await;

        assert!(result.is_err());
        // One initial attempt plus one retry.
        assert_eq!(attempts.get(), 2);
    }
}
