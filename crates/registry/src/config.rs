//! Settings for the registry core.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Registry service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryOptions {
    /// Buffer of each subscriber's local channel
    pub subscriber_buffer: usize,

    /// Upper bound on waiting for forwarders during close
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            subscriber_buffer: 100,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Health monitor settings. Per-service interval and timeout override the
/// defaults here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    #[serde(with = "humantime_serde")]
    pub default_check_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Upper bound of the driving tick
    #[serde(with = "humantime_serde")]
    pub max_tick: Duration,

    /// Consecutive failures before a temporary instance is evicted
    pub failure_threshold: u32,

    /// Heartbeat timeout as a multiple of the check interval
    pub heartbeat_timeout_multiplier: u32,

    /// Services checked concurrently within one sweep
    pub max_concurrent_services: usize,

    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            default_check_interval: Duration::from_secs(30),
            default_timeout: Duration::from_secs(5),
            max_tick: Duration::from_secs(10),
            failure_threshold: 3,
            heartbeat_timeout_multiplier: 3,
            max_concurrent_services: 16,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl HealthMonitorConfig {
    /// Driving tick: `min(default_check_interval, max_tick)`, never zero.
    pub fn tick_interval(&self) -> Duration {
        self.default_check_interval
            .min(self.max_tick)
            .max(Duration::from_millis(1))
    }

    /// Heartbeat timeout for a service checked every `interval`.
    pub fn heartbeat_timeout(&self, interval: Duration) -> Duration {
        interval * self.heartbeat_timeout_multiplier.max(1)
    }
}
