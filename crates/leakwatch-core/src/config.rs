//! Harness configuration (`leakwatch.toml`).
//!
//! Every knob the leak check exposes lives in [`Config`]. Defaults match the
//! behavior a GUI test suite wants out of the box: check after every test,
//! 100 kB of memory slack, no net thread or descriptor growth, and up to
//! 1000 event-loop pumps before a leak is declared.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::allowlist::{AllowlistPolicy, AllowlistRule};
use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Growth limits applied to a diff.
///
/// Memory limits are exclusive: growth of exactly `system_memory_bytes`
/// fails. Count limits are inclusive: a net growth equal to the limit passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub system_memory_bytes: i64,
    pub managed_memory_bytes: i64,
    pub os_threads: i64,
    pub managed_threads: i64,
    pub open_descriptors: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            system_memory_bytes: 100_000,
            managed_memory_bytes: 100_000,
            os_threads: 0,
            managed_threads: 0,
            open_descriptors: 0,
        }
    }
}

/// Budget for pumping the UI event loop after a failed check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Maximum pump-and-recheck iterations.
    pub max_iterations: u32,
    /// Optional wall-clock cap in milliseconds, checked before each pump.
    pub max_duration_ms: Option<u64>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            max_duration_ms: None,
        }
    }
}

impl ReconcileConfig {
    #[must_use]
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }
}

/// One allow-list entry as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistEntry {
    /// Regex that must match the entire thread name.
    pub pattern: String,
    /// Exempt while the diff count is below this value. Omitted = unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
}

impl AllowlistEntry {
    fn unlimited(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            quota: None,
        }
    }
}

/// Filter applied to resolved descriptor targets before counting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorFilter {
    /// Drop `.jar` and `.class` targets (artifacts opened by parallel builds).
    pub exclude_build_artifacts: bool,
    /// Additional suffixes to drop.
    pub exclude_suffixes: Vec<String>,
    /// Drop targets containing any of these substrings.
    pub exclude_substrings: Vec<String>,
}

impl DescriptorFilter {
    /// Whether a resolved target should be counted.
    #[must_use]
    pub fn keeps(&self, target: &str) -> bool {
        if self.exclude_build_artifacts
            && (target.ends_with(".jar") || target.ends_with(".class"))
        {
            return false;
        }
        if self.exclude_suffixes.iter().any(|s| target.ends_with(s.as_str())) {
            return false;
        }
        !self
            .exclude_substrings
            .iter()
            .any(|s| target.contains(s.as_str()))
    }
}

/// Top-level harness configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// When false every lifecycle hook is a no-op.
    pub enabled: bool,
    /// Log a full snapshot at every lifecycle hook.
    pub verbose: bool,
    /// Check after every test. When false only suite boundaries are compared.
    pub collect_on_each_test: bool,
    pub thresholds: Thresholds,
    pub reconcile: ReconcileConfig,
    pub descriptors: DescriptorFilter,
    pub allowlist: Vec<AllowlistEntry>,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            verbose: false,
            collect_on_each_test: true,
            thresholds: Thresholds::default(),
            reconcile: ReconcileConfig::default(),
            descriptors: DescriptorFilter::default(),
            allowlist: default_allowlist(),
            log: LogConfig::default(),
        }
    }
}

/// Benign runtime threads: JIT compilers, collectors, debugger and signal
/// plumbing.
fn default_allowlist() -> Vec<AllowlistEntry> {
    [
        "C.*CompilerThr.*",
        "Common-Cleaner",
        "Finalizer",
        "G1.*",
        "GC Thread.*",
        "JDWP.*",
        "RMI.*",
        "Reference Handler.*",
        "Signal Dispatcher.*",
    ]
    .into_iter()
    .map(AllowlistEntry::unlimited)
    .collect()
}

impl Config {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconcile.max_duration_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "reconcile.max_duration_ms must be positive when set".to_string(),
            ));
        }
        let t = &self.thresholds;
        if t.system_memory_bytes < 0 || t.managed_memory_bytes < 0 {
            return Err(ConfigError::ValidationError(
                "memory thresholds must not be negative".to_string(),
            ));
        }
        self.allowlist_policy().map(|_| ())
    }

    /// Compile the allow-list entries.
    pub fn allowlist_policy(&self) -> Result<AllowlistPolicy, ConfigError> {
        self.allowlist
            .iter()
            .map(|entry| AllowlistRule::new(&entry.pattern, entry.quota.unwrap_or(i64::MAX)))
            .collect::<Result<Vec<_>, _>>()
            .map(AllowlistPolicy::new)
    }
}
