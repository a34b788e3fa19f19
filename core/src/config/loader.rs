use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::config::error::{ConfigError, Result};
use crate::geo;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TRACKSIM";

/// Config file name searched in the working directory.
pub const CONFIG_FILE_NAME: &str = "tracksim.toml";

/// Login credential of one simulated courier.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourierCredential {
    /// Login identity (the service uses the courier's email).
    #[serde(alias = "email")]
    pub identity: String,
    #[serde(alias = "password")]
    pub secret: String,
}

impl CourierCredential {
    pub fn new(identity: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for CourierCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CourierCredential")
            .field("identity", &self.identity)
            .field("secret", &"***")
            .finish()
    }
}

/// Root simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Base URL of the tracking service API, e.g. `http://localhost:3001/api`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Couriers the simulator may drive
    #[serde(default)]
    pub couriers: Vec<CourierCredential>,

    /// Seconds between reconciliation sweeps
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub path: PathConfig,

    #[serde(default)]
    pub pacing: PacingConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Cancel running simulations whose delivery turned DELIVERED/CANCELLED
    #[serde(default = "default_true")]
    pub cancel_terminal: bool,

    /// Seconds to wait for tasks to stop on shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// Trajectory shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathConfig {
    /// Waypoints per generated path (including both endpoints)
    #[serde(default = "default_point_count")]
    pub point_count: usize,

    /// Interior jitter bound in degrees, per axis
    #[serde(default = "default_jitter_degrees")]
    pub jitter_degrees: f64,

    /// Max offset of the synthetic origin from the destination when the
    /// delivery has no last known location
    #[serde(default = "default_cold_start_offset_degrees")]
    pub cold_start_offset_degrees: f64,
}

/// Delay between two waypoint reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_pacing_min_ms")]
    pub min_ms: u64,

    #[serde(default = "default_pacing_max_ms")]
    pub max_ms: u64,

    /// Shrink the delay as the courier gets closer to the destination
    #[serde(default)]
    pub proximity_scaling: bool,
}

/// Bounded retry of transient report failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt of a single waypoint
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_factor")]
    pub factor: f64,
}

// Default value functions
fn default_base_url() -> String {
    "http://localhost:3001/api".to_string()
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_point_count() -> usize {
    50
}
fn default_jitter_degrees() -> f64 {
    crate::geo::DEFAULT_JITTER_DEGREES
}
fn default_cold_start_offset_degrees() -> f64 {
    0.1
}
fn default_pacing_min_ms() -> u64 {
    2000
}
fn default_pacing_max_ms() -> u64 {
    4000
}
fn default_max_retries() -> usize {
    3
}
fn default_initial_backoff_ms() -> u64 {
    250
}
fn default_max_backoff_ms() -> u64 {
    4000
}
fn default_factor() -> f64 {
    2.0
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            point_count: default_point_count(),
            jitter_degrees: default_jitter_degrees(),
            cold_start_offset_degrees: default_cold_start_offset_degrees(),
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_ms: default_pacing_min_ms(),
            max_ms: default_pacing_max_ms(),
            proximity_scaling: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            factor: default_factor(),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            couriers: Vec::new(),
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            path: PathConfig::default(),
            pacing: PacingConfig::default(),
            retry: RetryConfig::default(),
            cancel_terminal: default_true(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl SimulatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn credential(&self, identity: &str) -> Option<&CourierCredential> {
        self.couriers.iter().find(|c| c.identity == identity)
    }

    /// Check cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "base_url must not be empty".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.path.point_count < 2 {
            return Err(ConfigError::ValidationError(format!(
                "path.point_count must be at least 2, got {}",
                self.path.point_count
            )));
        }
        geo::check_spread("path.jitter_degrees", self.path.jitter_degrees)?;
        geo::check_spread(
            "path.cold_start_offset_degrees",
            self.path.cold_start_offset_degrees,
        )?;
        if self.pacing.min_ms > self.pacing.max_ms {
            return Err(ConfigError::ValidationError(format!(
                "pacing.min_ms ({}) exceeds pacing.max_ms ({})",
                self.pacing.min_ms, self.pacing.max_ms
            )));
        }
        if !self.retry.factor.is_finite() || self.retry.factor < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "retry.factor must be >= 1.0, got {}",
                self.retry.factor
            )));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::ValidationError(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for courier in &self.couriers {
            if courier.identity.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "courier identity must not be empty".to_string(),
                ));
            }
            if !seen.insert(courier.identity.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate courier identity: {}",
                    courier.identity
                )));
            }
        }
        Ok(())
    }

    /// Render as TOML with every courier secret masked.
    pub fn to_toml_redacted(&self) -> Result<String> {
        let mut redacted = self.clone();
        for courier in &mut redacted.couriers {
            courier.secret = "***".to_string();
        }
        Ok(toml::to_string_pretty(&redacted)?)
    }
}

/// Configuration loader with layered merging support
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Merge defaults, the config file (if any) and `TRACKSIM_*` environment
    /// variables, then validate.
    pub fn load(&self) -> Result<SimulatorConfig> {
        let mut builder = Config::builder();

        // Layer 1: defaults, serialized so every key exists before merging
        let defaults_json = serde_json::to_string(&SimulatorConfig::default())?;
        builder = builder.add_source(File::from_str(
            &defaults_json,
            ::config::FileFormat::Json,
        ));

        // Layer 2: config file
        if let Some(ref path) = self.config_path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            builder = builder.add_source(File::from(path.as_path()));
        }

        // Layer 3: environment, e.g. TRACKSIM_PACING__MIN_MS=500
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: SimulatorConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Locate the config file in standard locations:
    /// 1. Current directory: `./tracksim.toml`
    /// 2. XDG config: `~/.config/tracksim/config.toml`
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from(CONFIG_FILE_NAME);
        if cwd_config.exists() {
            return Some(cwd_config);
        }

        dirs::config_dir()
            .map(|dir| dir.join("tracksim").join("config.toml"))
            .filter(|path| path.exists())
    }

    /// Load from the first config file found, or from defaults and env only.
    pub fn load_default() -> Result<SimulatorConfig> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::debug!("Loading configuration from {}", path.display());
                ConfigLoader::new().with_file(path).load()
            }
            None => ConfigLoader::new().load(),
        }
    }
}
