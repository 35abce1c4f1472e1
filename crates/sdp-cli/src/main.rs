//! SDP CLI - Main entry point
//!
//! Thin driver around the ETL engine: advance the batch control row, run
//! the pipeline, apply migrations, and inspect recent batch activity.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use sdp_common::logging::{init_logging, LogConfig};
use sdp_etl::batch::{BatchId, BatchRegistry};
use sdp_etl::storage::{config::StorageConfig, Storage};
use sdp_etl::{db, EtlConfig, Pipeline};

#[derive(Parser)]
#[command(name = "sdp")]
#[command(about = "Batch pipeline for the sales warehouse", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose console logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Advance the batch control row to the next batch
    Advance {
        /// Batch number; must be greater than the current one
        #[arg(long)]
        batch_no: i64,
        /// Batch date watermark (YYYY-MM-DD)
        #[arg(long)]
        batch_date: NaiveDate,
    },
    /// Run the full pipeline for the current batch
    Run {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply warehouse migrations
    Migrate,
    /// Show the current batch and recent run history
    Status {
        /// Number of log entries to show
        #[arg(long, default_value_t = 10)]
        limit: i64,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig {
            level: sdp_common::logging::LogLevel::Debug,
            ..LogConfig::default()
        }
    } else {
        LogConfig::from_env().unwrap_or_default()
    };
    let log_config = log_config.with_prefix("sdp-cli");

    if let Err(e) = init_logging(&log_config) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }

    if let Err(e) = execute_command(cli.command).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn execute_command(command: Commands) -> Result<()> {
    let config = EtlConfig::load().context("Failed to load configuration")?;

    match command {
        Commands::Advance {
            batch_no,
            batch_date,
        } => {
            let warehouse = db::connect_warehouse(&config.warehouse).await?;
            let registry = BatchRegistry::new(warehouse);

            let batch = registry
                .open_next(BatchId {
                    batch_no,
                    batch_date,
                })
                .await?;

            println!("Batch control advanced to {}", batch);
        },

        Commands::Run { json } => {
            let source = db::connect_source(&config.source).await?;
            let warehouse = db::connect_warehouse(&config.warehouse).await?;

            let storage_config =
                StorageConfig::from_env().context("Failed to load storage configuration")?;
            let storage = Storage::new(storage_config).await?;

            let pipeline = Pipeline::new(config.pipeline, source, warehouse, storage);
            let report = pipeline.run().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Completed {}", report.batch);
                for task in &report.extracted {
                    println!("  extracted {:<14} {:>8} rows", task.entity, task.rows);
                }
                println!("  staged {} rows", report.staged_rows);
                for (entity, stats) in &report.merged {
                    println!(
                        "  merged {:<16} {:>6} updated, {:>6} inserted",
                        entity, stats.updated, stats.inserted
                    );
                }
                for (name, stats) in &report.history {
                    println!(
                        "  history {:<15} {:>6} closed, {:>6} opened",
                        name, stats.closed, stats.opened
                    );
                }
                for (name, stats) in &report.rollups {
                    println!(
                        "  rollup {:<16} {:>6} daily, {:>6} monthly updated, {:>6} inserted",
                        name, stats.daily_rows, stats.monthly_updated, stats.monthly_inserted
                    );
                }
            }
        },

        Commands::Migrate => {
            let warehouse = db::connect_warehouse(&config.warehouse).await?;

            sqlx::migrate!("../../migrations")
                .run(&warehouse)
                .await
                .context("Failed to run migrations")?;

            info!("Migrations applied");
            println!("Migrations applied");
        },

        Commands::Status { limit, json } => {
            let warehouse = db::connect_warehouse(&config.warehouse).await?;
            let registry = BatchRegistry::new(warehouse);

            let current = registry.current_batch().await?;
            let history = registry.history(limit).await?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "current": current,
                        "history": history,
                    }))?
                );
            } else {
                println!("Current: {}", current);
                for entry in history {
                    let end = entry
                        .end_time
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "  batch {:>6}  {}  {:?}  started {}  ended {}",
                        entry.batch_no,
                        entry.batch_date,
                        entry.status,
                        entry.start_time.to_rfc3339(),
                        end
                    );
                }
            }
        },
    }

    Ok(())
}
