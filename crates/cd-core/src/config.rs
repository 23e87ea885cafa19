use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::types::OperationKind;

/// Top-level configuration loaded from `~/.cadence/config.toml`.
///
/// Every section is optional; missing sections and fields fall back to
/// their defaults. The daemon re-reads this file every cycle through a
/// [`ConfigSource`], so changes apply without a restart.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub targets: TargetsConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub legacy: LegacyConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
    #[serde(default)]
    pub income: IncomeConfig,
}

impl Config {
    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fleet.validate()?;
        self.targets.validate()?;
        self.batch.validate()?;
        self.legacy.validate()?;
        self.operations.validate()?;
        self.income.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// Which mode the daemon runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Batch when the fleet is big enough, legacy otherwise.
    #[default]
    Auto,
    Batch,
    Legacy,
    Throughput,
    Drain,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Run exactly one cycle, then exit.
    #[serde(default)]
    pub one_shot: bool,
    #[serde(default)]
    pub strategy: Strategy,
    /// Upper bound on the sleep between cycles.
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    /// Lower bound on the sleep between cycles.
    #[serde(default = "default_min_sleep_ms")]
    pub min_sleep_ms: u64,
    /// Sleep after a cycle that found nothing to do.
    #[serde(default = "default_no_target_backoff_ms")]
    pub no_target_backoff_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            one_shot: false,
            strategy: Strategy::default(),
            cycle_interval_ms: default_cycle_interval_ms(),
            min_sleep_ms: default_min_sleep_ms(),
            no_target_backoff_ms: default_no_target_backoff_ms(),
        }
    }
}

fn default_cycle_interval_ms() -> u64 {
    1_000
}
fn default_min_sleep_ms() -> u64 {
    20
}
fn default_no_target_backoff_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetConfig {
    /// The node the daemon itself runs on. Never ceded to the share workload.
    #[serde(default = "default_primary_node")]
    pub primary_node: String,
    /// Capacity kept free on the primary node for other daemons.
    #[serde(default = "default_reserved_primary_capacity")]
    pub reserved_primary_capacity: f64,
    /// Percentage of total capacity ceded to the share workload.
    #[serde(default)]
    pub share_percent: f64,
    /// Total fleet capacity at which `Strategy::Auto` picks batch mode.
    #[serde(default = "default_batch_min_capacity")]
    pub batch_min_capacity: f64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            primary_node: default_primary_node(),
            reserved_primary_capacity: default_reserved_primary_capacity(),
            share_percent: 0.0,
            batch_min_capacity: default_batch_min_capacity(),
        }
    }
}

impl FleetConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..100.0).contains(&self.share_percent) {
            return Err(ConfigError::Validation(format!(
                "fleet.share_percent must be in [0, 100), got {}",
                self.share_percent
            )));
        }
        if self.reserved_primary_capacity < 0.0 {
            return Err(ConfigError::Validation(
                "fleet.reserved_primary_capacity must not be negative".into(),
            ));
        }
        Ok(())
    }
}

fn default_primary_node() -> String {
    "home".into()
}
fn default_reserved_primary_capacity() -> f64 {
    32.0
}
fn default_batch_min_capacity() -> f64 {
    256.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetsConfig {
    /// How many of the best-scored targets the engine tracks.
    #[serde(default = "default_max_targets")]
    pub max_targets: usize,
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            max_targets: default_max_targets(),
        }
    }
}

impl TargetsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_targets == 0 {
            return Err(ConfigError::Validation(
                "targets.max_targets must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_targets() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    /// Concurrent batches per target. 0 picks a ceiling from fleet size.
    #[serde(default)]
    pub max_batches_per_target: u32,
    /// Width of the window in which one batch's four completions land.
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    /// Fraction of a target's maximum yield extracted per batch.
    #[serde(default = "default_extraction_fraction")]
    pub extraction_fraction: f64,
    /// Slack after `expected_end` before a batch is reconciled.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Relative yield shortfall still accepted as "at baseline".
    #[serde(default = "default_yield_tolerance")]
    pub yield_tolerance: f64,
    /// Absolute defense excess still accepted as "at baseline".
    #[serde(default = "default_defense_tolerance")]
    pub defense_tolerance: f64,
    /// Round trip assumed for recovered batches whose target is unreadable.
    #[serde(default = "default_recovery_round_trip_ms")]
    pub recovery_round_trip_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batches_per_target: 0,
            batch_window_ms: default_batch_window_ms(),
            extraction_fraction: default_extraction_fraction(),
            grace_period_ms: default_grace_period_ms(),
            yield_tolerance: default_yield_tolerance(),
            defense_tolerance: default_defense_tolerance(),
            recovery_round_trip_ms: default_recovery_round_trip_ms(),
        }
    }
}

impl BatchConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_window_ms < 4 {
            return Err(ConfigError::Validation(
                "batch.batch_window_ms must be at least 4".into(),
            ));
        }
        if !(self.extraction_fraction > 0.0 && self.extraction_fraction < 1.0) {
            return Err(ConfigError::Validation(format!(
                "batch.extraction_fraction must be in (0, 1), got {}",
                self.extraction_fraction
            )));
        }
        if self.yield_tolerance < 0.0 || self.defense_tolerance < 0.0 {
            return Err(ConfigError::Validation(
                "batch tolerances must not be negative".into(),
            ));
        }
        Ok(())
    }
}

fn default_batch_window_ms() -> u64 {
    1_000
}
fn default_extraction_fraction() -> f64 {
    0.1
}
fn default_grace_period_ms() -> u64 {
    150
}
fn default_yield_tolerance() -> f64 {
    0.02
}
fn default_defense_tolerance() -> f64 {
    0.05
}
fn default_recovery_round_trip_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LegacyConfig {
    /// Counteract when defense exceeds its minimum by more than this.
    #[serde(default = "default_defense_margin")]
    pub defense_margin: f64,
    /// Restore when yield is below this fraction of its maximum.
    #[serde(default = "default_yield_threshold")]
    pub yield_threshold: f64,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            defense_margin: default_defense_margin(),
            yield_threshold: default_yield_threshold(),
        }
    }
}

impl LegacyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.yield_threshold > 0.0 && self.yield_threshold <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "legacy.yield_threshold must be in (0, 1], got {}",
                self.yield_threshold
            )));
        }
        Ok(())
    }
}

fn default_defense_margin() -> f64 {
    5.0
}
fn default_yield_threshold() -> f64 {
    0.75
}

/// Capacity one thread of each operation kind occupies on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationsConfig {
    #[serde(default = "default_extract_cost")]
    pub extract_cost: f64,
    #[serde(default = "default_counteract_cost")]
    pub counteract_cost: f64,
    #[serde(default = "default_restore_cost")]
    pub restore_cost: f64,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            extract_cost: default_extract_cost(),
            counteract_cost: default_counteract_cost(),
            restore_cost: default_restore_cost(),
        }
    }
}

impl OperationsConfig {
    pub fn cost(&self, kind: OperationKind) -> f64 {
        match kind {
            OperationKind::Extract => self.extract_cost,
            OperationKind::Counteract => self.counteract_cost,
            OperationKind::Restore => self.restore_cost,
        }
    }

    /// Same cost for every kind. Handy in tests.
    pub fn uniform(cost: f64) -> Self {
        Self {
            extract_cost: cost,
            counteract_cost: cost,
            restore_cost: cost,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for kind in OperationKind::ALL {
            if self.cost(kind) <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "operations cost for {kind} must be positive"
                )));
            }
        }
        Ok(())
    }
}

fn default_extract_cost() -> f64 {
    1.70
}
fn default_counteract_cost() -> f64 {
    1.75
}
fn default_restore_cost() -> f64 {
    1.75
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncomeConfig {
    #[serde(default = "default_income_log_path")]
    pub log_path: String,
    /// Samples older than this are dropped from the window.
    #[serde(default = "default_income_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_income_max_samples")]
    pub max_samples: usize,
    /// Time constant of the exponential smoothing.
    #[serde(default = "default_income_smoothing_secs")]
    pub smoothing_secs: f64,
}

impl Default for IncomeConfig {
    fn default() -> Self {
        Self {
            log_path: default_income_log_path(),
            window_secs: default_income_window_secs(),
            max_samples: default_income_max_samples(),
            smoothing_secs: default_income_smoothing_secs(),
        }
    }
}

impl IncomeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_samples < 2 {
            return Err(ConfigError::Validation(
                "income.max_samples must be at least 2".into(),
            ));
        }
        if self.smoothing_secs <= 0.0 {
            return Err(ConfigError::Validation(
                "income.smoothing_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_income_log_path() -> String {
    "~/.cadence/income.json".into()
}
fn default_income_window_secs() -> u64 {
    900
}
fn default_income_max_samples() -> usize {
    2_000
}
fn default_income_smoothing_secs() -> f64 {
    60.0
}

// ---------------------------------------------------------------------------
// ConfigSource
// ---------------------------------------------------------------------------

/// Re-reads the config file on demand, keeping the last good value when the
/// file is missing or invalid.
#[derive(Debug)]
pub struct ConfigSource {
    path: Option<PathBuf>,
    current: Config,
}

impl ConfigSource {
    /// Watch `path`. The initial value is whatever the file holds now, or
    /// the defaults if it cannot be read.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let mut source = Self {
            path: Some(path.into()),
            current: Config::default(),
        };
        source.refresh();
        source
    }

    /// A source that never touches the filesystem.
    pub fn fixed(config: Config) -> Self {
        Self {
            path: None,
            current: config,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn current(&self) -> &Config {
        &self.current
    }

    /// Re-read the file and return the effective config.
    pub fn refresh(&mut self) -> &Config {
        if let Some(path) = &self.path {
            if path.exists() {
                match Config::load_from(path) {
                    Ok(cfg) => {
                        if cfg != self.current {
                            debug!(path = %path.display(), "config changed");
                        }
                        self.current = cfg;
                    }
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "config reload failed, keeping previous"
                        );
                    }
                }
            }
        }
        &self.current
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}
