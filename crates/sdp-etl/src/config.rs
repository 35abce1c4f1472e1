//! ETL configuration
//!
//! Every component receives its configuration explicitly at construction;
//! nothing reads the environment after startup.

use serde::{Deserialize, Serialize};

use sdp_common::SdpError;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default source database URL for local development.
pub const DEFAULT_SOURCE_DATABASE_URL: &str = "postgresql://localhost/sdp_source";

/// Default warehouse database URL for local development.
pub const DEFAULT_WAREHOUSE_DATABASE_URL: &str = "postgresql://localhost/sdp_dw";

/// Default maximum connections per pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default minimum connections per pool.
pub const DEFAULT_MIN_CONNECTIONS: u32 = 2;

/// Default connection timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default number of extraction tasks allowed to run at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default retry count for a failed stage unit of work.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Top-level ETL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    pub source: DbConfig,
    pub warehouse: DbConfig,
    pub pipeline: PipelineConfig,
}

/// Connection settings for one database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Pipeline scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Bound on concurrent extraction tasks.
    pub max_concurrency: usize,
    /// Retries per stage unit of work before the run is aborted.
    pub max_retries: u32,
}

impl EtlConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self, SdpError> {
        dotenvy::dotenv().ok();

        let config = EtlConfig {
            source: DbConfig::from_env("SOURCE", DEFAULT_SOURCE_DATABASE_URL),
            warehouse: DbConfig::from_env("WAREHOUSE", DEFAULT_WAREHOUSE_DATABASE_URL),
            pipeline: PipelineConfig {
                max_concurrency: std::env::var("ETL_MAX_CONCURRENCY")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_MAX_CONCURRENCY),
                max_retries: std::env::var("ETL_MAX_RETRIES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_MAX_RETRIES),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), SdpError> {
        self.source.validate("source")?;
        self.warehouse.validate("warehouse")?;

        if self.pipeline.max_concurrency == 0 {
            return Err(SdpError::config("ETL_MAX_CONCURRENCY must be greater than 0"));
        }

        Ok(())
    }
}

impl DbConfig {
    /// Read one database's settings from `{PREFIX}_DATABASE_URL` and friends
    fn from_env(prefix: &str, default_url: &str) -> Self {
        let var = |suffix: &str| std::env::var(format!("{}_{}", prefix, suffix)).ok();

        Self {
            url: var("DATABASE_URL").unwrap_or_else(|| default_url.to_string()),
            max_connections: var("DB_MAX_CONNECTIONS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            min_connections: var("DB_MIN_CONNECTIONS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MIN_CONNECTIONS),
            connect_timeout_secs: var("DB_CONNECT_TIMEOUT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    fn validate(&self, which: &str) -> Result<(), SdpError> {
        if self.url.is_empty() {
            return Err(SdpError::config(format!("{} database URL cannot be empty", which)));
        }

        if self.max_connections == 0 {
            return Err(SdpError::config(format!(
                "{} max_connections must be greater than 0",
                which
            )));
        }

        if self.min_connections > self.max_connections {
            return Err(SdpError::config(format!(
                "{} min_connections ({}) cannot be greater than max_connections ({})",
                which, self.min_connections, self.max_connections
            )));
        }

        Ok(())
    }
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            source: DbConfig {
                url: DEFAULT_SOURCE_DATABASE_URL.to_string(),
                max_connections: DEFAULT_MAX_CONNECTIONS,
                min_connections: DEFAULT_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            },
            warehouse: DbConfig {
                url: DEFAULT_WAREHOUSE_DATABASE_URL.to_string(),
                max_connections: DEFAULT_MAX_CONNECTIONS,
                min_connections: DEFAULT_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            },
            pipeline: PipelineConfig {
                max_concurrency: DEFAULT_MAX_CONCURRENCY,
                max_retries: DEFAULT_MAX_RETRIES,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EtlConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = EtlConfig::default();
        config.pipeline.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_bounds_rejected() {
        let mut config = EtlConfig::default();
        config.warehouse.min_connections = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_url_rejected() {
        let mut config = EtlConfig::default();
        config.source.url = String::new();
        assert!(config.validate().is_err());
    }
}
