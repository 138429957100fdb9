//! tapwire collectors
//!
//! The two capture policies layered on the hook engine, configuration
//! included:
//!
//! - [`EntityCollector`], continuous telemetry: a wraparound channel fed by
//!   an entity-iteration hook, drained at ~60 Hz into a snapshot of resolved
//!   [`EntityRecord`]s, with pause/resume for consumers that need a stable
//!   view.
//! - [`SkillCastDetector`], transactional detection: a flag-gated channel
//!   fed by a cast-commit hook, polled from the owner's logic tick, one
//!   observer callback per event.
//!
//! Both are thin wiring over [`tapwire_hook`]; neither adds capture
//! machinery of its own.

pub mod config;
pub mod entities;
pub mod skills;

pub use config::{
    CollectorConfig, ConfigError, ConfigResult, DetectorConfig, HookPointConfig, TelemetryConfig,
};
pub use entities::{EntityCollector, EntityRecord, EntityResolver};
pub use skills::{SkillCastDetector, SkillCastObserver};
