//! Configuration System using Figment
//!
//! Strongly-typed configuration for the chip test routine. Configuration is
//! loaded from:
//! 1. `config/dmf_chip_qc.toml` (base configuration)
//! 2. Environment variables (prefixed with `DMF_QC_`, sections split on `__`)
//!
//! Every section is optional; missing keys fall back to the defaults below.
//!
//! # Example
//! ```no_run
//! use dmf_chip_qc::config::QcConfig;
//!
//! let config = QcConfig::load()?;
//! config.validate()?;
//! println!("Retry attempts: {}", config.retry.max_attempts);
//! # Ok::<(), dmf_chip_qc::error::QcError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{QcError, QcResult};
use crate::executor::RetryPolicy;
use crate::graph::{Channel, ChannelGraph};
use crate::plan::TestRoute;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/dmf_chip_qc.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DMF_QC_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QcConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Per-hop retry bounds
    #[serde(default)]
    pub retry: RetryConfig,
    /// Chip graph source
    #[serde(default)]
    pub chip: ChipConfig,
    /// Default test route
    #[serde(default)]
    pub route: TestRoute,
    /// Where run output goes
    #[serde(default)]
    pub output: OutputConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Retry configuration, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per hop
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Deadline for one transfer attempt
    #[serde(default = "default_hop_timeout")]
    pub hop_timeout_ms: u64,
    /// Pause between attempts
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
}

/// Chip description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChipConfig {
    /// JSON file with the chip's channels and connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_path: Option<PathBuf>,
    /// Channels removed from the graph before every run
    #[serde(default)]
    pub bad_channels: Vec<Channel>,
    /// Identifier recorded in `test-start`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chip_uuid: Option<String>,
}

/// Output configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// JSON-lines event log, appended to during a run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events_path: Option<PathBuf>,
}

// Default value functions
fn default_name() -> String {
    "DMF Chip QC".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_hop_timeout() -> u64 {
    4000
}

fn default_backoff() -> u64 {
    1000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            hop_timeout_ms: default_hop_timeout(),
            backoff_ms: default_backoff(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            hop_timeout: Duration::from_millis(config.hop_timeout_ms),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

impl QcConfig {
    /// Load configuration from `config/dmf_chip_qc.toml` and environment
    /// variables.
    ///
    /// Environment variables override the file, e.g.
    /// `DMF_QC_RETRY__MAX_ATTEMPTS=5` or `DMF_QC_APPLICATION__LOG_LEVEL=debug`.
    pub fn load() -> QcResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file leaves
    /// the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> QcResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// Provider chain: defaults, then the TOML file, then the environment.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(QcConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> QcResult<()> {
        if !LOG_LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(QcError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if !LOG_FORMATS.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(QcError::Config(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            )));
        }

        self.retry_policy().validate()?;

        if self.route.waypoints.is_empty() {
            return Err(QcError::Config("route needs at least one waypoint".into()));
        }

        if let Some(start) = self.route.start {
            if !self.route.waypoints.contains(&start) {
                return Err(QcError::Config(format!(
                    "start electrode {start} is not one of the waypoints"
                )));
            }
        }

        Ok(())
    }

    /// Retry bounds as an executor policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    /// Load the configured chip graph with bad channels removed.
    pub fn load_graph(&self) -> QcResult<ChannelGraph> {
        let path = self
            .chip
            .graph_path
            .as_ref()
            .ok_or_else(|| QcError::Config("chip.graph_path is not set".into()))?;
        let graph = ChannelGraph::from_json_file(path)?;
        Ok(graph.without(self.chip.bad_channels.iter().copied()))
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> QcResult<String> {
        toml::to_string_pretty(self).map_err(|e| QcError::Config(e.to_string()))
    }
}
