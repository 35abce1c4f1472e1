//! Connection pool construction for the source and warehouse databases

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DbConfig;
use crate::error::{EtlError, Result};

/// Connect a pool to the operational source database
pub async fn connect_source(config: &DbConfig) -> Result<PgPool> {
    connect(config, "source").await
}

/// Connect a pool to the staging/warehouse database
pub async fn connect_warehouse(config: &DbConfig) -> Result<PgPool> {
    connect(config, "warehouse").await
}

async fn connect(config: &DbConfig, system: &'static str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|source| EtlError::Connection { system, source })
}
