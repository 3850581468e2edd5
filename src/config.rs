//! Configuration management for cluster-tiler.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (CLUSTER_TILER_UNITS, etc.)
//! 2. Project-local config file (`./cluster-tiler.toml`)
//! 3. User config file (`~/.config/cluster-tiler/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # cluster-tiler.toml
//!
//! # Execution units in the SPMD team
//! units = 8
//!
//! # Local scratchpad capacity in bytes
//! local_bytes = 65536
//!
//! # Outstanding DMA transfers before a submitter stalls
//! dma_queue_depth = 16
//!
//! # Output write-back: "blocking" or "deferred"
//! writeback = "blocking"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use crate::device::dma::DEFAULT_QUEUE_DEPTH;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Default team size.
pub const DEFAULT_UNITS: usize = 8;

/// Default local scratchpad capacity.
pub const DEFAULT_LOCAL_BYTES: usize = 64 * 1024;

/// When an output tile write-back completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritebackPolicy {
    /// Waited in the iteration that issued it
    #[default]
    Blocking,
    /// Waited before the next write-back and at the end of the layer
    Deferred,
}

impl FromStr for WritebackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blocking" | "sync" => Ok(WritebackPolicy::Blocking),
            "deferred" | "async" => Ok(WritebackPolicy::Deferred),
            other => Err(format!("unknown write-back policy '{}'", other)),
        }
    }
}

/// Resolved engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub units: usize,
    pub local_capacity: usize,
    pub queue_depth: usize,
    pub writeback: WritebackPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            units: DEFAULT_UNITS,
            local_capacity: DEFAULT_LOCAL_BYTES,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            writeback: WritebackPolicy::Blocking,
        }
    }
}

/// cluster-tiler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Execution units in the SPMD team.
    pub units: Option<usize>,

    /// Local scratchpad capacity in bytes.
    pub local_bytes: Option<usize>,

    /// DMA queue depth.
    pub dma_queue_depth: Option<usize>,

    /// Output write-back policy.
    pub writeback: Option<WritebackPolicy>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `cluster-tiler.toml`
    /// 3. User config `~/.config/cluster-tiler/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Resolve to engine settings, filling gaps with defaults.
    pub fn engine(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            units: self.units.unwrap_or(defaults.units).max(1),
            local_capacity: self.local_bytes.unwrap_or(defaults.local_capacity),
            queue_depth: self.dma_queue_depth.unwrap_or(defaults.queue_depth).max(1),
            writeback: self.writeback.unwrap_or(defaults.writeback),
        }
    }

    fn load_user_config() -> Option<Self> {
        Self::load_from_file(&Self::user_config_path()?)
    }

    fn load_local_config() -> Option<Self> {
        let local_path = Path::new("cluster-tiler.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("cluster-tiler.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.units.is_some() {
            self.units = other.units;
        }
        if other.local_bytes.is_some() {
            self.local_bytes = other.local_bytes;
        }
        if other.dma_queue_depth.is_some() {
            self.dma_queue_depth = other.dma_queue_depth;
        }
        if other.writeback.is_some() {
            self.writeback = other.writeback;
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a variable lookup.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(units) = parse_var(&lookup, "CLUSTER_TILER_UNITS") {
            self.units = Some(units);
        }
        if let Some(bytes) = parse_var(&lookup, "CLUSTER_TILER_LOCAL_BYTES") {
            self.local_bytes = Some(bytes);
        }
        if let Some(depth) = parse_var(&lookup, "CLUSTER_TILER_DMA_QUEUE_DEPTH") {
            self.dma_queue_depth = Some(depth);
        }
        if let Some(policy) = parse_var(&lookup, "CLUSTER_TILER_WRITEBACK") {
            self.writeback = Some(policy);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("cluster-tiler").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# cluster-tiler configuration
# Place this file at ~/.config/cluster-tiler/config.toml or ./cluster-tiler.toml

# Execution units in the SPMD team
units = 8

# Local scratchpad capacity in bytes
local_bytes = 65536

# Outstanding DMA transfers before a submitter stalls
# dma_queue_depth = 16

# Output write-back: "blocking" or "deferred"
# writeback = "blocking"
"#
        .to_string()
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => {
            log::info!("Using {} from environment: {}", key, raw);
            Some(value)
        }
        Err(e) => {
            log::warn!("Ignoring {}={}: {}", key, raw, e);
            None
        }
    }
}
