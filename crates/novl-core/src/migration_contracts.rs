//! Contracts shared between the migration phase controller, the shadow
//! validator and the storage backends they route between.

use crate::{ChapterRecord, Translation, UrlMapping};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Rollout phase of one logical service. Phases only advance forward along
/// this order, or reset to `Shadow` on rollback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPhase {
    Shadow,
    Reads,
    DualWrite,
    Writes,
    Complete,
}

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Shadow => "shadow",
            MigrationPhase::Reads => "reads",
            MigrationPhase::DualWrite => "dualwrite",
            MigrationPhase::Writes => "writes",
            MigrationPhase::Complete => "complete",
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationPhase {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "shadow" => Ok(MigrationPhase::Shadow),
            "reads" => Ok(MigrationPhase::Reads),
            "dualwrite" | "dual-write" | "dual_write" => Ok(MigrationPhase::DualWrite),
            "writes" => Ok(MigrationPhase::Writes),
            "complete" => Ok(MigrationPhase::Complete),
            other => Err(format!("unknown migration phase: {other}")),
        }
    }
}

/// Global backend selector. `Legacy` pins every service to the old backend
/// regardless of per-service phase progress.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Legacy,
    Migrating,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::Legacy => "legacy",
            BackendMode::Migrating => "migrating",
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "legacy" => Ok(BackendMode::Legacy),
            "migrating" => Ok(BackendMode::Migrating),
            other => Err(format!("unknown backend mode: {other}")),
        }
    }
}

/// Persisted rollout state of one logical service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationState {
    pub service: String,
    pub phase: MigrationPhase,
    pub shadow_validated: bool,
    pub reads_validated: bool,
    pub writes_validated: bool,
    /// Explicit routing switch. Validation alone never routes traffic; an
    /// operator has to flip this per service.
    pub enabled: bool,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationState {
    pub fn new(service: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            service: service.into(),
            phase: MigrationPhase::Shadow,
            shadow_validated: false,
            reads_validated: false,
            writes_validated: false,
            enabled: false,
            error_count: 0,
            last_error: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Rollback: back to `Shadow` with every gate and the routing switch
    /// cleared. Error counters survive so the operator can see history.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.phase = MigrationPhase::Shadow;
        self.shadow_validated = false;
        self.reads_validated = false;
        self.writes_validated = false;
        self.enabled = false;
        self.updated_at = now;
    }
}

/// Structural comparison used by the shadow validator. Implementations
/// compare the critical fields of one entity kind; transport details like
/// row ids and timestamps are deliberately excluded so the two backends can
/// assign them independently.
pub trait ShadowCompare {
    fn shadow_eq(&self, other: &Self) -> bool;
}

impl ShadowCompare for Translation {
    fn shadow_eq(&self, other: &Self) -> bool {
        self.stable_id == other.stable_id
            && self.version == other.version
            && self.is_active == other.is_active
            && self.content == other.content
    }
}

impl ShadowCompare for ChapterRecord {
    fn shadow_eq(&self, other: &Self) -> bool {
        self.stable_id == other.stable_id && self.canonical_url == other.canonical_url
    }
}

impl ShadowCompare for UrlMapping {
    fn shadow_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl<T: ShadowCompare> ShadowCompare for Option<T> {
    fn shadow_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.shadow_eq(b),
            _ => false,
        }
    }
}

impl<T: ShadowCompare> ShadowCompare for Vec<T> {
    fn shadow_eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|(a, b)| a.shadow_eq(b))
    }
}

impl ShadowCompare for () {
    fn shadow_eq(&self, _other: &Self) -> bool {
        true
    }
}

impl ShadowCompare for i64 {
    fn shadow_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl ShadowCompare for bool {
    fn shadow_eq(&self, other: &Self) -> bool {
        self == other
    }
}
