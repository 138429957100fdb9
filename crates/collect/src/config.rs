//! Collector configuration
//!
//! TOML-backed settings for the two collectors. Hook points are deployment
//! data (they track the target binary's build), so everything the engine
//! must not hardcode lives here: module-relative hook offsets, stolen
//! lengths, capture registers, slot counts, tick rates and the entity
//! struct's field offsets.
//!
//! ```toml
//! [hook]
//! offset = 0x4F2A10
//! stolen_len = 6
//! capture_register = "rdi"
//!
//! [collector]
//! slot_count = 256
//! tick_ms = 16
//! min_address = 0x10000
//!
//! [entity]
//! id = 0x08
//! position = 0x10
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use tapwire_hook::GpReg;
use tapwire_memory::{OffsetTable, MIN_PLAUSIBLE_ADDR};

/// Configuration system errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML content
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A capture register name did not parse
    #[error("bad capture register: {0}")]
    BadRegister(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Where to hook: module-relative offset plus the offline-verified patch
/// geometry. Callers add their resolved module base to `offset`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HookPointConfig {
    pub offset: u64,
    pub stolen_len: usize,
    pub capture_register: String,
}

impl Default for HookPointConfig {
    fn default() -> Self {
        Self {
            offset: 0,
            stolen_len: 5,
            capture_register: "rdi".into(),
        }
    }
}

impl HookPointConfig {
    /// Parse the configured capture register
    pub fn capture_register(&self) -> ConfigResult<GpReg> {
        self.capture_register
            .parse()
            .map_err(ConfigError::BadRegister)
    }

    /// Absolute hook address for a resolved module base
    pub fn target(&self, module_base: usize) -> usize {
        module_base + self.offset as usize
    }
}

/// Entity collector tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollectorConfig {
    /// Channel slot count; must be a power of two
    pub slot_count: u32,
    /// Poll interval in milliseconds
    pub tick_ms: u64,
    /// Smallest raw value treated as a plausible pointer
    pub min_address: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            slot_count: 256,
            tick_ms: 16,
            min_address: MIN_PLAUSIBLE_ADDR,
        }
    }
}

/// Skill-cast detector hook point: one capture register per event word
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    pub offset: u64,
    pub stolen_len: usize,
    pub capture_registers: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            offset: 0,
            stolen_len: 5,
            capture_registers: vec!["rdx".into()],
        }
    }
}

impl DetectorConfig {
    pub fn capture_registers(&self) -> ConfigResult<Vec<GpReg>> {
        self.capture_registers
            .iter()
            .map(|s| s.parse().map_err(ConfigError::BadRegister))
            .collect()
    }

    pub fn target(&self, module_base: usize) -> usize {
        module_base + self.offset as usize
    }
}

/// Top-level telemetry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub hook: HookPointConfig,
    pub collector: CollectorConfig,
    pub skill: DetectorConfig,
    /// Entity struct field offsets, by field name
    pub entity: HashMap<String, usize>,
}

impl TelemetryConfig {
    /// Parse from TOML text
    pub fn parse(text: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Entity offsets as a table for the structured reader
    pub fn entity_offsets(&self) -> OffsetTable {
        self.entity.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}
