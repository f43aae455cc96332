//! Configuration: TOML file plus environment overrides, validated once at
//! startup and never mutated at runtime.

use crate::error::ConfigError;
use crate::registry::{ConcurrencyClass, PriorityTier, ScheduleSpec, TaskRegistry, Unit, UnitKind};
use anyhow::{Context, Result};
use chrono::Duration;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const SECRET_KEY_ENV: &str = "HIVECORE_SECRET_KEY";

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the loaded config file - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Directory holding the state documents and the ledger file.
    #[serde(default = "default_honeycomb_dir")]
    pub honeycomb_dir: PathBuf,

    /// Integrity-tag key. The `HIVECORE_SECRET_KEY` env var wins over the
    /// file value.
    #[serde(default)]
    pub secret_key: Option<String>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default, rename = "unit")]
    pub units: Vec<UnitConfig>,
}

fn default_honeycomb_dir() -> PathBuf {
    PathBuf::from("honeycomb")
}

// ── Scheduler ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Run attempts per request, counting the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Immediate retries after an optimistic-concurrency conflict.
    #[serde(default = "default_commit_retries")]
    pub commit_retries: u32,

    /// Per-run deadline before the worker is abandoned.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    #[serde(default)]
    pub caps: ConcurrencyCaps,
}

fn default_tick_interval_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_commit_retries() -> u32 {
    3
}
fn default_run_timeout_secs() -> u64 {
    120
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            commit_retries: default_commit_retries(),
            run_timeout_secs: default_run_timeout_secs(),
            caps: ConcurrencyCaps::default(),
        }
    }
}

/// Independent cap per concurrency class. The ledger cap is pinned to 1:
/// appends stay single-writer, which removes any need for merge logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyCaps {
    #[serde(default = "default_ledger_cap")]
    pub ledger: usize,
    #[serde(default = "default_content_cap")]
    pub content: usize,
    #[serde(default = "default_research_cap")]
    pub research: usize,
}

fn default_ledger_cap() -> usize {
    1
}
fn default_content_cap() -> usize {
    2
}
fn default_research_cap() -> usize {
    2
}

impl Default for ConcurrencyCaps {
    fn default() -> Self {
        Self {
            ledger: default_ledger_cap(),
            content: default_content_cap(),
            research: default_research_cap(),
        }
    }
}

impl ConcurrencyCaps {
    pub fn cap(&self, class: ConcurrencyClass) -> usize {
        match class {
            ConcurrencyClass::Ledger => self.ledger,
            ConcurrencyClass::Content => self.content,
            ConcurrencyClass::Research => self.research,
        }
    }
}

// ── Ledger ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Size of the recent idempotency-key index scanned at append time.
    #[serde(default = "default_recent_key_window")]
    pub recent_key_window: usize,
}

fn default_recent_key_window() -> usize {
    1024
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            recent_key_window: default_recent_key_window(),
        }
    }
}

// ── Policy thresholds ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Minimum fraction of payout revenue routed to the artist.
    #[serde(default = "default_artist_min_share")]
    pub artist_min_share: f64,

    /// Tag every sponsored publish must carry.
    #[serde(default = "default_disclosure_tag")]
    pub disclosure_tag: String,

    /// Emergency reserve the balance may never drop below.
    #[serde(default = "default_reserve_floor_cents")]
    pub reserve_floor_cents: i64,

    /// Sponsored publishes allowed per rolling hour.
    #[serde(default = "default_max_sponsored_per_hour")]
    pub max_sponsored_per_hour: u32,
}

fn default_artist_min_share() -> f64 {
    0.50
}
fn default_disclosure_tag() -> String {
    "[PARTNER]".into()
}
fn default_reserve_floor_cents() -> i64 {
    2_000
}
fn default_max_sponsored_per_hour() -> u32 {
    1
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            artist_min_share: default_artist_min_share(),
            disclosure_tag: default_disclosure_tag(),
            reserve_floor_cents: default_reserve_floor_cents(),
            max_sponsored_per_hour: default_max_sponsored_per_hour(),
        }
    }
}

// ── Units ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    pub id: String,
    pub kind: UnitKind,

    #[serde(default)]
    pub tier: PriorityTier,

    /// Exactly one of `interval_minutes` / `cron` may be set; neither means
    /// the unit only runs via `spawn` or an event subscription.
    #[serde(default)]
    pub interval_minutes: Option<i64>,
    #[serde(default)]
    pub cron: Option<String>,

    #[serde(default = "default_unit_class")]
    pub class: ConcurrencyClass,

    #[serde(default)]
    pub subscribes: Vec<String>,
}

fn default_unit_class() -> ConcurrencyClass {
    ConcurrencyClass::Content
}

impl UnitConfig {
    fn schedule(&self) -> Result<ScheduleSpec, ConfigError> {
        match (&self.interval_minutes, &self.cron) {
            (Some(_), Some(_)) => Err(ConfigError::Validation(format!(
                "unit {}: interval_minutes and cron are mutually exclusive",
                self.id
            ))),
            (Some(minutes), None) => {
                if *minutes <= 0 {
                    return Err(ConfigError::Validation(format!(
                        "unit {}: interval_minutes must be positive",
                        self.id
                    )));
                }
                Ok(ScheduleSpec::Every(Duration::minutes(*minutes)))
            }
            (None, Some(expr)) => {
                let schedule = Schedule::from_str(expr).map_err(|e| {
                    ConfigError::Validation(format!("unit {}: bad cron expression: {e}", self.id))
                })?;
                Ok(ScheduleSpec::Cron(Box::new(schedule)))
            }
            (None, None) => Ok(ScheduleSpec::Manual),
        }
    }
}

// ── Loading / validation ─────────────────────────────────────────

impl Config {
    /// Load from a TOML file, apply env overrides, validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| ConfigError::Load(e.to_string()))
            .context("parsing config")?;
        config.config_path = path.to_path_buf();

        // Relative honeycomb dir resolves next to the config file.
        if config.honeycomb_dir.is_relative() {
            if let Some(parent) = path.parent() {
                config.honeycomb_dir = parent.join(&config.honeycomb_dir);
            }
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(SECRET_KEY_ENV) {
            if !key.is_empty() {
                self.secret_key = Some(key);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.secret_key {
            Some(key) if !key.is_empty() => {}
            _ => {
                return Err(ConfigError::Validation(format!(
                    "secret_key missing: set it in the config file or via {SECRET_KEY_ENV}"
                )));
            }
        }

        if self.scheduler.caps.ledger != 1 {
            return Err(ConfigError::Validation(
                "scheduler.caps.ledger must be 1: ledger appends are single-writer".into(),
            ));
        }
        if self.scheduler.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "scheduler.max_attempts must be at least 1".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.policy.artist_min_share) {
            return Err(ConfigError::Validation(
                "policy.artist_min_share must be within [0, 1]".into(),
            ));
        }
        if self.policy.reserve_floor_cents < 0 {
            return Err(ConfigError::Validation(
                "policy.reserve_floor_cents must not be negative".into(),
            ));
        }

        // Schedules must parse even though the registry is built later.
        for unit in &self.units {
            unit.schedule()?;
        }
        Ok(())
    }

    pub fn secret_key_bytes(&self) -> &[u8] {
        self.secret_key.as_deref().unwrap_or_default().as_bytes()
    }

    /// Build the immutable unit registry from the `[[unit]]` tables.
    pub fn build_registry(&self) -> Result<TaskRegistry, ConfigError> {
        let mut units = Vec::with_capacity(self.units.len());
        for spec in &self.units {
            units.push(Unit {
                id: spec.id.clone(),
                kind: spec.kind,
                tier: spec.tier,
                schedule: spec.schedule()?,
                class: spec.class,
                subscribes: spec.subscribes.clone(),
            });
        }
        TaskRegistry::new(units)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.honeycomb_dir.join("ledger.jsonl")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            honeycomb_dir: default_honeycomb_dir(),
            secret_key: None,
            scheduler: SchedulerConfig::default(),
            ledger: LedgerConfig::default(),
            policy: PolicyConfig::default(),
            units: Vec::new(),
        }
    }
}
