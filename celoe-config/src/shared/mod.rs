mod connection;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use connection::{IntoConnectOptions, MySqlConnectionConfig, PgConnectionConfig};

/// Errors produced when validating configuration values.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("batch page_size must be greater than zero")]
    ZeroPageSize,

    #[error("batch insert_chunk_size must be greater than zero")]
    ZeroInsertChunkSize,

    #[error("max_concurrency must be greater than zero")]
    ZeroConcurrency,

    #[error("memory soft_threshold must be below hard_threshold")]
    MemoryThresholdsInverted,

    #[error("stuck timeout_minutes must be below hard_timeout_minutes")]
    StuckTimeoutsInverted,
}

/// Top-level configuration for the ETL service.
///
/// `source` is the read-only Moodle database, `target` is the reporting
/// database holding the `celoeapi` schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EtlConfig {
    pub source: MySqlConnectionConfig,
    pub target: PgConnectionConfig,
    pub pipeline: PipelineConfig,
}

impl EtlConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.pipeline.validate()
    }
}

/// Tunables for the batch ETL engine.
///
/// All values can be overridden per environment or via `APP_PIPELINE__*`
/// environment variables so that retuning for a larger dataset never requires
/// a code change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub stuck: StuckConfig,
    /// Maximum number of day-windows processed in parallel. 1 means strictly
    /// sequential processing with per-window watermark advancement.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u16,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch.page_size == 0 {
            return Err(ValidationError::ZeroPageSize);
        }
        if self.batch.insert_chunk_size == 0 {
            return Err(ValidationError::ZeroInsertChunkSize);
        }
        if self.max_concurrency == 0 {
            return Err(ValidationError::ZeroConcurrency);
        }
        if self.memory.soft_threshold >= self.memory.hard_threshold {
            return Err(ValidationError::MemoryThresholdsInverted);
        }
        if self.stuck.timeout_minutes >= self.stuck.hard_timeout_minutes {
            return Err(ValidationError::StuckTimeoutsInverted);
        }

        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            memory: MemoryConfig::default(),
            stuck: StuckConfig::default(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// Batch sizing for extraction pages and insert chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Rows fetched per page during full-table paginated extraction.
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    /// Rows per insert statement when loading a window. Each chunk runs in its
    /// own transaction to bound transaction size and lock duration.
    #[serde(default = "default_insert_chunk_size")]
    pub insert_chunk_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            insert_chunk_size: default_insert_chunk_size(),
        }
    }
}

/// Soft memory ceiling for long single-pass extractions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MemoryConfig {
    /// Memory budget in megabytes. 0 disables the guard.
    #[serde(default = "default_memory_limit_mb")]
    pub limit_mb: u64,
    /// Fraction of the budget at which a warning is emitted.
    #[serde(default = "default_soft_threshold")]
    pub soft_threshold: f32,
    /// Fraction of the budget at which the run is aborted.
    #[serde(default = "default_hard_threshold")]
    pub hard_threshold: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            limit_mb: default_memory_limit_mb(),
            soft_threshold: default_soft_threshold(),
            hard_threshold: default_hard_threshold(),
        }
    }
}

/// Timeouts used by the stuck-run reclaimer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StuckConfig {
    /// Runs still `running` after this many minutes are force-failed.
    #[serde(default = "default_stuck_timeout_minutes")]
    pub timeout_minutes: i64,
    /// Runs with no end time after this many minutes are force-failed
    /// regardless of status.
    #[serde(default = "default_stuck_hard_timeout_minutes")]
    pub hard_timeout_minutes: i64,
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_stuck_timeout_minutes(),
            hard_timeout_minutes: default_stuck_hard_timeout_minutes(),
        }
    }
}

fn default_max_concurrency() -> u16 {
    1
}

fn default_page_size() -> u64 {
    5_000
}

fn default_insert_chunk_size() -> usize {
    500
}

fn default_memory_limit_mb() -> u64 {
    512
}

fn default_soft_threshold() -> f32 {
    0.8
}

fn default_hard_threshold() -> f32 {
    0.95
}

fn default_stuck_timeout_minutes() -> i64 {
    10
}

fn default_stuck_hard_timeout_minutes() -> i64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipeline_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_memory_thresholds_are_rejected() {
        let mut config = PipelineConfig::default();
        config.memory.soft_threshold = 0.99;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::MemoryThresholdsInverted)
        ));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = PipelineConfig::default();
        config.max_concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::ZeroConcurrency)
        ));
    }
}
