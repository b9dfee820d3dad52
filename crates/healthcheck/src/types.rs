//! Health check types and structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Path probed when a service does not configure one.
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// Weight of the previous average in the response-time moving average.
const RESPONSE_TIME_DECAY: f64 = 0.8;

/// Outcome of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckStatus {
    /// Instance answered as expected
    Healthy,
    /// Instance answered, but not as expected
    Unhealthy,
    /// Probe did not finish within its timeout
    Timeout,
    /// Probe could not be performed
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Healthy => write!(f, "HEALTHY"),
            CheckStatus::Unhealthy => write!(f, "UNHEALTHY"),
            CheckStatus::Timeout => write!(f, "TIMEOUT"),
            CheckStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Health check result
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Status of the health check
    pub status: CheckStatus,

    /// Duration of the health check
    pub duration: Duration,

    /// Optional error message
    pub message: Option<String>,

    /// Response code (for HTTP checks)
    pub response_code: Option<u16>,
}

impl HealthCheckResult {
    /// Create a healthy result
    pub fn healthy(duration: Duration) -> Self {
        Self {
            status: CheckStatus::Healthy,
            duration,
            message: None,
            response_code: None,
        }
    }

    /// Create an unhealthy result
    pub fn unhealthy(duration: Duration, message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Unhealthy,
            duration,
            message: Some(message.into()),
            response_code: None,
        }
    }

    /// Create a timeout result
    pub fn timeout(duration: Duration) -> Self {
        Self {
            status: CheckStatus::Timeout,
            duration,
            message: Some("Health check timed out".to_string()),
            response_code: None,
        }
    }

    /// Create an error result
    pub fn error(duration: Duration, message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Error,
            duration,
            message: Some(message.into()),
            response_code: None,
        }
    }

    /// Check if the result is healthy
    pub fn is_healthy(&self) -> bool {
        self.status == CheckStatus::Healthy
    }

    /// Short human readable description of the outcome
    pub fn describe(&self) -> String {
        match &self.message {
            Some(message) => format!("{}: {}", self.status, message),
            None => self.status.to_string(),
        }
    }
}

/// Kind of outbound probe a service is checked with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckType {
    /// HTTP GET, 2xx is healthy
    #[default]
    Http,
    /// Plain TCP connect
    Tcp,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Http => "HTTP",
            CheckType::Tcp => "TCP",
        }
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HTTP" | "HTTPS" => Ok(CheckType::Http),
            "TCP" => Ok(CheckType::Tcp),
            other => Err(format!("unsupported health check type: {other}")),
        }
    }
}

/// Where and how to probe one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckTarget {
    pub check_type: CheckType,
    pub host: String,
    pub port: u16,
    /// Context path of the instance, prepended to relative check paths
    pub context_path: String,
    /// Relative path or absolute `http(s)://` URL
    pub path: String,
    pub timeout: Duration,
}

impl CheckTarget {
    pub fn new(check_type: CheckType, host: impl Into<String>, port: u16) -> Self {
        Self {
            check_type,
            host: host.into(),
            port,
            context_path: String::new(),
            path: DEFAULT_HEALTH_PATH.to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        if !path.trim().is_empty() {
            self.path = path;
        }
        self
    }

    pub fn with_context_path(mut self, context_path: impl Into<String>) -> Self {
        self.context_path = context_path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `host:port` for TCP dials and logging
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// URL probed by the HTTP checker
    pub fn url(&self) -> String {
        if self.path.starts_with("http://") || self.path.starts_with("https://") {
            return self.path.clone();
        }

        let context = self.context_path.trim_end_matches('/');
        let context = match context {
            "" => String::new(),
            c if c.starts_with('/') => c.to_string(),
            c => format!("/{c}"),
        };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };

        format!("http://{}{}{}", self.address(), context, path)
    }
}

/// Aggregate health check statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckStats {
    /// Total checks performed
    pub total_checks: u64,

    /// Successful checks
    pub successful_checks: u64,

    /// Failed checks, timeouts included
    pub failed_checks: u64,

    /// Timeout count
    pub timeouts: u64,

    /// Moving average of probe response time (milliseconds)
    pub avg_response_time_ms: f64,

    /// Instances seen by the most recent sweep
    pub active_instances: usize,
}

impl HealthCheckStats {
    /// Update stats with a probe result
    pub fn update(&mut self, result: &HealthCheckResult) {
        match result.status {
            CheckStatus::Healthy => self.record_success(),
            CheckStatus::Unhealthy | CheckStatus::Error => self.record_failure(),
            CheckStatus::Timeout => {
                self.timeouts += 1;
                self.record_failure();
            }
        }
        self.record_response_time(result.duration);
    }

    /// Count a successful check that involved no probe
    pub fn record_success(&mut self) {
        self.total_checks += 1;
        self.successful_checks += 1;
    }

    /// Count a failed check that involved no probe
    pub fn record_failure(&mut self) {
        self.total_checks += 1;
        self.failed_checks += 1;
    }

    fn record_response_time(&mut self, duration: Duration) {
        let duration_ms = duration.as_secs_f64() * 1000.0;
        self.avg_response_time_ms = if self.avg_response_time_ms == 0.0 {
            duration_ms
        } else {
            self.avg_response_time_ms * RESPONSE_TIME_DECAY
                + duration_ms * (1.0 - RESPONSE_TIME_DECAY)
        };
    }

    /// Successful checks as a percentage of all checks
    pub fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            return 0.0;
        }
        self.successful_checks as f64 / self.total_checks as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_type_parsing() {
        assert_eq!("http".parse::<CheckType>(), Ok(CheckType::Http));
        assert_eq!(" TCP ".parse::<CheckType>(), Ok(CheckType::Tcp));
        assert!("icmp".parse::<CheckType>().is_err());
        assert_eq!(serde_json::to_string(&CheckType::Tcp).unwrap(), "\"TCP\"");
    }

    #[test]
    fn test_target_url() {
        let target = CheckTarget::new(CheckType::Http, "10.0.0.1", 8080);
        assert_eq!(target.url(), "http://10.0.0.1:8080/health");

        let target = target.with_context_path("api/").with_path("status");
        assert_eq!(target.url(), "http://10.0.0.1:8080/api/status");

        let target = CheckTarget::new(CheckType::Http, "10.0.0.1", 8080)
            .with_path("https://probe.example.com/ready");
        assert_eq!(target.url(), "https://probe.example.com/ready");

        let target = CheckTarget::new(CheckType::Tcp, "::1", 9000).with_path("  ");
        assert_eq!(target.address(), "[::1]:9000");
        assert_eq!(target.path, DEFAULT_HEALTH_PATH);
    }

    #[test]
    fn test_moving_average_weights_history() {
        let mut stats = HealthCheckStats::default();
        stats.update(&HealthCheckResult::healthy(Duration::from_millis(100)));
        stats.update(&HealthCheckResult::healthy(Duration::from_millis(200)));

        // 100 * 0.8 + 200 * 0.2
        assert!((stats.avg_response_time_ms - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_success_rate() {
        let mut stats = HealthCheckStats::default();
        assert_eq!(stats.success_rate(), 0.0);

        stats.record_success();
        stats.record_success();
        stats.record_success();
        stats.update(&HealthCheckResult::timeout(Duration::from_millis(5)));

        assert_eq!(stats.total_checks, 4);
        assert_eq!(stats.failed_checks, 1);
        assert_eq!(stats.timeouts, 1);
        assert!((stats.success_rate() - 75.0).abs() < 1e-9);
    }
}
