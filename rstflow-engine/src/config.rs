//! Daemon configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RSTFLOW_CONFIG)
//! 3. Environment variables

use rstflow_core::DEFAULT_MAX_TRANSITION_DEPTH;
use rstflow_store::{FsyncPolicy, StoreConfig};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub sweeper: SweeperConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("RSTFLOW_CONFIG").ok();
        Self::load_from(path.as_deref(), &|key| std::env::var(key).ok())
    }

    /// Loads from an optional file and variable source. Overrides are
    /// validated together with the file, so a bad override is an error
    /// even when no file is given.
    pub fn load_from(
        path: Option<&str>,
        vars: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_overrides(vars);
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::ParseError(_, msg) => ConfigError::ParseError(path.to_path_buf(), msg),
            other => other,
        })
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(PathBuf::new(), e.to_string()))
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(&|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary variable source.
    pub fn apply_overrides(&mut self, vars: &dyn Fn(&str) -> Option<String>) {
        self.storage.apply_overrides(vars);
        self.engine.apply_overrides(vars);
        self.sweeper.apply_overrides(vars);
        self.metrics.apply_overrides(vars);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_transition_depth == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_transition_depth must be at least 1".to_string(),
            ));
        }
        if self.sweeper.enabled && self.sweeper.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sweeper.interval_secs must be positive when the sweeper is enabled".to_string(),
            ));
        }
        if self.sweeper.timeout_event.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "sweeper.timeout_event must not be empty".to_string(),
            ));
        }
        if let FsyncPolicy::EveryN(0) = self.storage.fsync_policy {
            return Err(ConfigError::ValidationError(
                "storage.fsync_policy every_n needs N > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory.
    pub data_dir: PathBuf,
    /// Journal commits to disk. When off, state lives in memory only.
    pub journal: bool,
    pub fsync_policy: FsyncPolicy,
    /// Row lock wait limit in milliseconds (0 = wait forever).
    pub lock_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            journal: true,
            fsync_policy: FsyncPolicy::EveryCommit,
            lock_timeout_ms: 0,
        }
    }
}

impl StorageConfig {
    fn apply_overrides(&mut self, vars: &dyn Fn(&str) -> Option<String>) {
        if let Some(dir) = vars("RSTFLOW_DATA") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Some(journal) = vars("RSTFLOW_JOURNAL") {
            self.journal = flag(&journal);
        }

        if let Some(policy) = vars("RSTFLOW_FSYNC_POLICY") {
            match FsyncPolicy::parse(&policy) {
                Some(parsed) => self.fsync_policy = parsed,
                None => {
                    tracing::warn!(value = %policy, "ignoring unrecognized RSTFLOW_FSYNC_POLICY")
                }
            }
        }

        if let Some(timeout) = vars("RSTFLOW_LOCK_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.lock_timeout_ms = ms;
            }
        }
    }

    /// Returns the journal file path.
    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("journal.log")
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        match self.lock_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Builds the store configuration.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            journal_path: self.journal.then(|| self.journal_path()),
            fsync_policy: self.fsync_policy,
            lock_timeout: self.lock_timeout(),
        }
    }
}

/// Dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cap on state changes per dispatch.
    pub max_transition_depth: u32,
    /// Directory of JSON/YAML workflow definitions.
    pub definitions_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_transition_depth: DEFAULT_MAX_TRANSITION_DEPTH,
            definitions_dir: PathBuf::from("./definitions"),
        }
    }
}

impl EngineConfig {
    fn apply_overrides(&mut self, vars: &dyn Fn(&str) -> Option<String>) {
        if let Some(depth) = vars("RSTFLOW_MAX_DEPTH") {
            if let Ok(n) = depth.parse() {
                self.max_transition_depth = n;
            }
        }

        if let Some(dir) = vars("RSTFLOW_DEFINITIONS") {
            self.definitions_dir = PathBuf::from(dir);
        }
    }
}

/// Timeout sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    /// Seconds between sweeps.
    pub interval_secs: u64,
    /// Event type delivered to expired instances.
    pub timeout_event: String,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            timeout_event: "TIMEOUT".to_string(),
        }
    }
}

impl SweeperConfig {
    fn apply_overrides(&mut self, vars: &dyn Fn(&str) -> Option<String>) {
        if let Some(enabled) = vars("RSTFLOW_SWEEP_ENABLED") {
            self.enabled = flag(&enabled);
        }

        if let Some(interval) = vars("RSTFLOW_SWEEP_INTERVAL") {
            if let Ok(secs) = interval.parse() {
                self.interval_secs = secs;
            }
        }

        if let Some(event) = vars("RSTFLOW_TIMEOUT_EVENT") {
            self.timeout_event = event;
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_overrides(&mut self, vars: &dyn Fn(&str) -> Option<String>) {
        if let Some(enabled) = vars("RSTFLOW_METRICS_ENABLED") {
            self.enabled = flag(&enabled);
        }
        if let Some(addr) = vars("RSTFLOW_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serializes `SocketAddr` as a string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
