//! Configuration loading and validation for the registry server

use common::logging::LogFormat;
use registry::{HealthMonitorConfig, RegistryOptions, ServiceInstance};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub monitor: MonitorSettings,
    pub registry: RegistrySettings,
    pub metrics: MetricsSettings,
    pub event_log: EventLogSettings,
    pub telemetry: TelemetrySettings,
    pub logging: LoggingSettings,
    pub bootstrap: BootstrapSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.monitor.validate()?;
        self.registry.validate()?;
        self.metrics.validate()?;
        self.event_log.validate()?;
        for instance in &self.bootstrap.instances {
            instance.validate()?;
        }
        Ok(())
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MonitorSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_check_interval")]
    pub check_interval: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_probe_timeout")]
    pub timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_check_interval")]
    pub max_tick: Duration,

    #[validate(range(min = 1, max = 100))]
    pub failure_threshold: u32,

    #[validate(range(min = 1, max = 100))]
    pub heartbeat_timeout_multiplier: u32,

    #[validate(range(min = 1, max = 1024))]
    pub max_concurrent_services: usize,

    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

/// Registry core settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_publisher_capacity"))]
#[serde(default)]
pub struct RegistrySettings {
    #[validate(range(min = 1, max = 100000))]
    pub subscriber_buffer: usize,

    /// Broadcast capacity per subscription key, at least `subscriber_buffer`
    #[validate(range(min = 16, max = 1000000))]
    pub publisher_capacity: usize,

    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

/// Metrics endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,

    #[validate(custom = "validate_listen_addr")]
    pub listen_addr: String,

    /// How often monitor and subscriber gauges are refreshed
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_stats_interval")]
    pub stats_interval: Duration,
}

/// Event log settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EventLogSettings {
    pub enabled: bool,

    #[validate(length(min = 1))]
    pub path: String,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_batch_delay")]
    pub batch_delay: Duration,

    #[validate(range(min = 1, max = 10000))]
    pub max_batch: usize,

    #[validate(range(min = 10, max = 100000))]
    pub channel_size: usize,
}

/// OpenTelemetry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub service_name: String,
    pub otlp_endpoint: String,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: LogFormat,
}

/// Instances registered when the server starts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    pub instances: Vec<BootstrapInstance>,
}

/// One statically configured instance
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BootstrapInstance {
    #[validate(length(min = 1))]
    pub tenant_id: String,

    #[validate(length(min = 1))]
    pub service_name: String,

    #[validate(length(min = 1))]
    pub group_name: String,

    #[validate(length(min = 1))]
    pub host_address: String,

    #[validate(range(min = 1, max = 65535))]
    pub port_number: i32,

    #[serde(default)]
    pub context_path: String,

    #[serde(default)]
    pub temp_instance: bool,

    /// Zero takes the registry default
    #[serde(default)]
    pub weight: u32,

    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl BootstrapInstance {
    pub fn to_instance(&self) -> ServiceInstance {
        let mut instance = ServiceInstance::new(
            &self.tenant_id,
            &self.service_name,
            &self.group_name,
            &self.host_address,
            self.port_number,
        );
        instance.context_path = self.context_path.clone();
        instance.temp_instance = self.temp_instance;
        instance.weight_value = self.weight;
        instance.metadata = self.metadata.clone();
        instance
    }
}

// Default implementations

impl Default for MonitorSettings {
    fn default() -> Self {
        let core = HealthMonitorConfig::default();
        Self {
            check_interval: core.default_check_interval,
            timeout: core.default_timeout,
            max_tick: core.max_tick,
            failure_threshold: core.failure_threshold,
            heartbeat_timeout_multiplier: core.heartbeat_timeout_multiplier,
            max_concurrent_services: core.max_concurrent_services,
            shutdown_grace: core.shutdown_grace,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        let core = RegistryOptions::default();
        Self {
            subscriber_buffer: core.subscriber_buffer,
            publisher_capacity: registry::publisher::DEFAULT_CHANNEL_CAPACITY,
            shutdown_grace: core.shutdown_grace,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:9464".to_string(),
            stats_interval: Duration::from_secs(15),
        }
    }
}

impl Default for EventLogSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "./registry-events.jsonl".to_string(),
            batch_delay: Duration::from_millis(100),
            max_batch: 100,
            channel_size: 1000,
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "registry-server".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
        }
    }
}

// Custom validators

fn validate_check_interval(interval: &Duration) -> Result<(), ValidationError> {
    let millis = interval.as_millis();
    if !(10..=3_600_000).contains(&millis) {
        return Err(ValidationError::new("check_interval_out_of_range"));
    }
    Ok(())
}

/// A broadcast channel smaller than the subscriber buffer lags before the
/// buffer fills.
fn validate_publisher_capacity(settings: &RegistrySettings) -> Result<(), ValidationError> {
    if settings.publisher_capacity < settings.subscriber_buffer {
        return Err(ValidationError::new("publisher_capacity_below_subscriber_buffer"));
    }
    Ok(())
}

fn validate_probe_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    let millis = timeout.as_millis();
    if !(10..=60_000).contains(&millis) {
        return Err(ValidationError::new("probe_timeout_out_of_range"));
    }
    Ok(())
}

fn validate_stats_interval(interval: &Duration) -> Result<(), ValidationError> {
    let millis = interval.as_millis();
    if !(100..=600_000).contains(&millis) {
        return Err(ValidationError::new("stats_interval_out_of_range"));
    }
    Ok(())
}

fn validate_batch_delay(delay: &Duration) -> Result<(), ValidationError> {
    let millis = delay.as_millis();
    if !(1..=10_000).contains(&millis) {
        return Err(ValidationError::new("batch_delay_out_of_range"));
    }
    Ok(())
}

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.trim()
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

// Configuration loading implementation

impl Config {
    /// Load configuration from `path`, or from the default search paths when
    /// no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            return Self::load_from_file(path);
        }

        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/registry/registry-server.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./registry-server.yaml"));

        paths.into_iter().find(|p| p.is_file())
    }

    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/registry/registry-server.yaml"))
    }

    pub fn log_level(&self) -> &str {
        self.logging.level.as_deref().unwrap_or("info")
    }

    pub fn to_registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            subscriber_buffer: self.registry.subscriber_buffer,
            shutdown_grace: self.registry.shutdown_grace,
        }
    }

    pub fn to_monitor_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            default_check_interval: self.monitor.check_interval,
            default_timeout: self.monitor.timeout,
            max_tick: self.monitor.max_tick,
            failure_threshold: self.monitor.failure_threshold,
            heartbeat_timeout_multiplier: self.monitor.heartbeat_timeout_multiplier,
            max_concurrent_services: self.monitor.max_concurrent_services,
            shutdown_grace: self.monitor.shutdown_grace,
        }
    }
}
