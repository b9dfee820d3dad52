//! Health probes for registered service instances.
//!
//! This crate provides the outbound checks the registry's health monitor runs
//! against instances whose service is configured for active checking:
//! - HTTP checks (any 2xx response is healthy)
//! - TCP connection checks
//!
//! Every probe is bounded by the per-service timeout carried in its
//! [`CheckTarget`], so a hung backend never stalls the caller beyond it.
//!
//! # Example
//!
//! ```no_run
//! use healthcheck::{CheckTarget, CheckType, CheckerSet, HealthChecker};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let checkers = CheckerSet::new()?;
//! let target = CheckTarget::new(CheckType::Http, "10.0.0.1", 8080)
//!     .with_path("/health")
//!     .with_timeout(Duration::from_secs(5));
//!
//! let result = checkers.check(&target).await;
//! println!("healthy: {}", result.is_healthy());
//! # Ok(())
//! # }
//! ```

pub mod checkers;
pub mod types;

pub use checkers::{CheckerSet, HealthChecker, HttpChecker, TcpChecker};
pub use types::{
    CheckStatus, CheckTarget, CheckType, DEFAULT_HEALTH_PATH, HealthCheckResult,
    HealthCheckStats,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status_display() {
        assert_eq!(CheckStatus::Healthy.to_string(), "HEALTHY");
        assert_eq!(CheckStatus::Unhealthy.to_string(), "UNHEALTHY");
        assert_eq!(CheckStatus::Timeout.to_string(), "TIMEOUT");
        assert_eq!(CheckStatus::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_health_check_result() {
        let result = HealthCheckResult::healthy(std::time::Duration::from_millis(100));
        assert!(result.is_healthy());
        assert_eq!(result.status, CheckStatus::Healthy);
        assert!(result.message.is_none());
    }

    #[test]
    fn test_stats_update() {
        let mut stats = HealthCheckStats::default();

        let result = HealthCheckResult::healthy(std::time::Duration::from_millis(100));
        stats.update(&result);

        assert_eq!(stats.total_checks, 1);
        assert_eq!(stats.successful_checks, 1);
        assert_eq!(stats.failed_checks, 0);
        assert_eq!(stats.avg_response_time_ms, 100.0);
    }
}
