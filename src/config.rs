//! Engine configuration.
//!
//! Every section has defaults, so an empty JSON object is a valid config.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{EngineError, EngineResult};
use crate::storage::PhantomReads;
use crate::validation::{InputLimits, DEFAULT_MAX_KEY_LEN, DEFAULT_MAX_PAYLOAD_BYTES};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Input validation limits.
    pub limits: LimitsConfig,
    /// Facts about the storage backend's isolation.
    pub isolation: IsolationConfig,
    /// Periodic resolution.
    pub scheduler: SchedulerConfig,
}

/// Input validation limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Maximum key length in bytes.
    pub max_key_len: usize,
    /// Maximum serialized payload size in bytes.
    pub max_payload_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_key_len: DEFAULT_MAX_KEY_LEN,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl From<LimitsConfig> for InputLimits {
    fn from(cfg: LimitsConfig) -> Self {
        Self {
            max_key_len: cfg.max_key_len,
            max_payload_bytes: cfg.max_payload_bytes,
        }
    }
}

/// Isolation facts about the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IsolationConfig {
    /// Overrides the phantom-read behavior the backend reports. Set this when
    /// the deployed database's isolation level differs from the backend's
    /// default assumption.
    pub phantom_reads: Option<PhantomReads>,
}

/// Periodic resolution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Milliseconds between ticks.
    pub interval_ms: u64,
    /// Entities resolved per chunk.
    pub chunk_size: usize,
    /// Upper bound on chunks per tick.
    pub max_chunks_per_tick: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            chunk_size: 512,
            max_chunks_per_tick: 16,
        }
    }
}

impl SchedulerConfig {
    /// Tick interval as a `Duration`.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl EngineConfig {
    /// Parses a JSON document and validates it.
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::config(format!("invalid config json: {e}")))?;
        cfg.validate()
    }

    /// Rejects zero-valued limits and scheduler settings.
    pub fn validate(self) -> EngineResult<Self> {
        if self.limits.max_key_len == 0 {
            return Err(EngineError::config("limits.max_key_len must be non-zero"));
        }
        if self.limits.max_payload_bytes < 2 {
            return Err(EngineError::config(
                "limits.max_payload_bytes must fit at least an empty object",
            ));
        }
        if self.scheduler.interval_ms == 0 {
            return Err(EngineError::config("scheduler.interval_ms must be non-zero"));
        }
        if self.scheduler.chunk_size == 0 {
            return Err(EngineError::config("scheduler.chunk_size must be non-zero"));
        }
        if self.scheduler.max_chunks_per_tick == 0 {
            return Err(EngineError::config(
                "scheduler.max_chunks_per_tick must be non-zero",
            ));
        }
        Ok(self)
    }
}
