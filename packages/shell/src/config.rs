use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::kernel::jobs::WorkerConfig;
use crate::kernel::publish::PublishConfig;

/// Shell configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// SQLite connection string for the job store.
    pub database_url: String,
    pub worker: WorkerConfig,
    /// Base delay for the job retry backoff (doubles each attempt).
    pub job_retry_base_delay_ms: i64,
    pub publish: PublishConfig,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            worker: WorkerConfig::default(),
            job_retry_base_delay_ms: 5_000,
            publish: PublishConfig::default(),
        }
    }
}

impl ShellConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();

        Ok(Self {
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            worker: WorkerConfig {
                concurrency: env::var("WORKER_CONCURRENCY")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()
                    .context("WORKER_CONCURRENCY must be a valid number")?,
                poll_interval: Duration::from_millis(
                    env::var("WORKER_POLL_INTERVAL_MS")
                        .unwrap_or_else(|_| "100".to_string())
                        .parse()
                        .context("WORKER_POLL_INTERVAL_MS must be a valid number")?,
                ),
            },
            job_retry_base_delay_ms: env::var("JOB_RETRY_BASE_DELAY_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .context("JOB_RETRY_BASE_DELAY_MS must be a valid number")?,
            publish: PublishConfig {
                max_retries: env::var("PUBLISH_MAX_RETRIES")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .context("PUBLISH_MAX_RETRIES must be a valid number")?,
                retry_base_delay_ms: env::var("PUBLISH_RETRY_BASE_DELAY_MS")
                    .unwrap_or_else(|_| "5000".to_string())
                    .parse()
                    .context("PUBLISH_RETRY_BASE_DELAY_MS must be a valid number")?,
                ..defaults.publish
            },
        })
    }
}
