// Instrumentation configuration
//
// Sizing knobs for the core tables and the set of runtime-internal throw
// methods the exception analyzer skips. Loaded from JSON; every field has a
// default so an empty object is a valid config.

use crate::types::MethodId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentationConfig {
    /// Initial breakpoint table slots (doubles when full)
    pub breakpoint_table_capacity: usize,
    /// Per-monitor bound on entry and wait queues
    pub monitor_wait_set_capacity: usize,
    pub max_raw_monitors: usize,
    /// Initial tag table slots, rounded up to a power of two
    pub tag_table_capacity: usize,
    pub tag_load_factor: f64,
    pub event_queue_capacity: usize,
    /// Methods implementing the runtime's throw machinery
    pub throw_scaffolding: Vec<MethodId>,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            breakpoint_table_capacity: 16,
            monitor_wait_set_capacity: 16,
            max_raw_monitors: 4096,
            tag_table_capacity: 64,
            tag_load_factor: 0.75,
            event_queue_capacity: 256,
            throw_scaffolding: Vec::new(),
        }
    }
}

impl InstrumentationConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breakpoint_table_capacity == 0 {
            return Err(ConfigError::Invalid(
                "breakpoint_table_capacity must be positive".to_string(),
            ));
        }
        if self.monitor_wait_set_capacity == 0 {
            return Err(ConfigError::Invalid(
                "monitor_wait_set_capacity must be positive".to_string(),
            ));
        }
        if self.max_raw_monitors == 0 || self.max_raw_monitors > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_raw_monitors out of range: {}",
                self.max_raw_monitors
            )));
        }
        if self.tag_table_capacity == 0 {
            return Err(ConfigError::Invalid(
                "tag_table_capacity must be positive".to_string(),
            ));
        }
        if !(self.tag_load_factor > 0.0 && self.tag_load_factor < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "tag_load_factor must be in (0, 1), got {}",
                self.tag_load_factor
            )));
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
