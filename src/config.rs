//! Streamer configuration: pool sizing, operation-kind guarantees and the
//! per-stream tunables listed in spec.md §6.3.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ConfigError, StreamError};

type Result<T> = std::result::Result<T, StreamError>;

/// Top-level configuration for the streaming core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamerConfig {
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub stream: StreamTuning,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection budget and per-kind guarantees (spec.md §4.2, §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// `TotalPooledConnections`, typ. 30-200.
    pub total_connections: u32,
    /// `QueueGuaranteedConnections`.
    pub queue_guaranteed: u32,
    /// `HealthCheckGuaranteedConnections`.
    pub health_check_guaranteed: u32,
    /// Idle connection recycle timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Retries for transient connection-factory errors (socket exhaustion).
    pub connect_retry_attempts: u8,
}

impl PoolConfig {
    /// `Streaming = Total - Queue - HealthCheck`, per spec.md §6.3.
    pub fn streaming_guaranteed(&self) -> u32 {
        self.total_connections
            .saturating_sub(self.queue_guaranteed)
            .saturating_sub(self.health_check_guaranteed)
    }
}

/// Per-stream tunables (spec.md §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamTuning {
    /// `ConnectionsPerStream`, typ. 10-30: worker count per buffered stream.
    pub connections_per_stream: usize,
    /// `BufferSegmentCount`, typ. 50-200.
    pub buffer_segment_count: usize,
    /// `StragglerThresholdMs`, default 3000.
    pub straggler_threshold_ms: u64,
    /// `MaxPerSegmentRetries`, default 3.
    pub max_per_segment_retries: u8,
    /// `IncompleteSizeFraction`, default 0.9.
    pub incomplete_size_fraction: f64,
    /// `SeekLoopGuard`, default 100.
    pub seek_loop_guard: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            total_connections: 60,
            queue_guaranteed: 10,
            health_check_guaranteed: 5,
            idle_timeout_secs: 300,
            connect_retry_attempts: 3,
        }
    }
}

impl Default for StreamTuning {
    fn default() -> Self {
        Self {
            connections_per_stream: 16,
            buffer_segment_count: 100,
            straggler_threshold_ms: 3000,
            max_per_segment_retries: 3,
            incomplete_size_fraction: 0.9,
            seek_loop_guard: 100,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            stream: StreamTuning::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl StreamerConfig {
    /// Actual read-ahead channel capacity: `max(configured, workers * 5)`
    /// per spec.md §4.4.
    pub fn buffer_capacity(&self) -> usize {
        self.stream
            .buffer_segment_count
            .max(self.stream.connections_per_stream * 5)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// Validate cross-field invariants spec.md §3 pins: the per-kind
    /// guarantees must exactly sum to the connection budget, and the
    /// per-stream tunables must be in sane ranges.
    pub fn validate(&self) -> Result<()> {
        let streaming = self.pool.streaming_guaranteed();
        let sum = self.pool.queue_guaranteed + self.pool.health_check_guaranteed + streaming;
        if sum != self.pool.total_connections || streaming == 0 {
            return Err(ConfigError::GuaranteesMismatch {
                queue: self.pool.queue_guaranteed,
                health_check: self.pool.health_check_guaranteed,
                streaming,
                total: self.pool.total_connections,
            }
            .into());
        }

        if self.stream.connections_per_stream == 0 {
            return Err(ConfigError::Invalid {
                field: "stream.connections_per_stream".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        if !(0.0..=1.0).contains(&self.stream.incomplete_size_fraction) {
            return Err(ConfigError::Invalid {
                field: "stream.incomplete_size_fraction".to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            }
            .into());
        }

        if self.stream.seek_loop_guard == 0 {
            return Err(ConfigError::Invalid {
                field: "stream.seek_loop_guard".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        Ok(())
    }
}
