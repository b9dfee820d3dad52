//! Health check implementations.

use crate::types::{CheckTarget, CheckType, HealthCheckResult};
use async_trait::async_trait;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Probe one target, bounded by `target.timeout`
    async fn check(&self, target: &CheckTarget) -> HealthCheckResult;

    /// Get the name of this checker
    fn name(&self) -> &str;
}

/// TCP health checker
#[derive(Debug, Default, Clone)]
pub struct TcpChecker;

impl TcpChecker {
    /// Create a new TCP health checker
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HealthChecker for TcpChecker {
    async fn check(&self, target: &CheckTarget) -> HealthCheckResult {
        let start = Instant::now();
        let address = target.address();

        match timeout(target.timeout, TcpStream::connect(address.as_str())).await {
            Ok(Ok(_stream)) => {
                let duration = start.elapsed();
                debug!(target = %address, duration_ms = duration.as_millis(), "TCP check successful");
                HealthCheckResult::healthy(duration)
            }
            Ok(Err(e)) => {
                let duration = start.elapsed();
                warn!(target = %address, error = %e, "TCP check failed");
                HealthCheckResult::unhealthy(duration, format!("Connection failed: {}", e))
            }
            Err(_) => {
                let duration = start.elapsed();
                warn!(target = %address, "TCP check timed out");
                HealthCheckResult::timeout(duration)
            }
        }
    }

    fn name(&self) -> &str {
        "tcp"
    }
}

/// HTTP health checker. One client is shared by every probe.
#[derive(Debug, Clone)]
pub struct HttpChecker {
    client: reqwest::Client,
}

impl HttpChecker {
    /// Create a new HTTP health checker
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(&self, target: &CheckTarget) -> HealthCheckResult {
        let start = Instant::now();
        let url = target.url();

        let request = self.client.get(&url).timeout(target.timeout);

        match timeout(target.timeout, request.send()).await {
            Ok(Ok(response)) => {
                let duration = start.elapsed();
                let status_code = response.status().as_u16();

                if response.status().is_success() {
                    debug!(url = %url, status = status_code, duration_ms = duration.as_millis(),
                           "HTTP check successful");
                    let mut result = HealthCheckResult::healthy(duration);
                    result.response_code = Some(status_code);
                    result
                } else {
                    warn!(url = %url, status = status_code, "HTTP check failed: unexpected status code");
                    let mut result = HealthCheckResult::unhealthy(
                        duration,
                        format!("Unexpected status code: {}", status_code),
                    );
                    result.response_code = Some(status_code);
                    result
                }
            }
            Ok(Err(e)) if e.is_timeout() => {
                let duration = start.elapsed();
                warn!(url = %url, "HTTP check timed out");
                HealthCheckResult::timeout(duration)
            }
            Ok(Err(e)) => {
                let duration = start.elapsed();
                warn!(url = %url, error = %e, "HTTP check failed");
                HealthCheckResult::error(duration, format!("HTTP request failed: {}", e))
            }
            Err(_) => {
                let duration = start.elapsed();
                warn!(url = %url, "HTTP check timed out");
                HealthCheckResult::timeout(duration)
            }
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Dispatches each target to the checker for its [`CheckType`].
#[derive(Debug, Clone)]
pub struct CheckerSet {
    http: HttpChecker,
    tcp: TcpChecker,
}

impl CheckerSet {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: HttpChecker::new()?,
            tcp: TcpChecker::new(),
        })
    }

    /// Checker responsible for `check_type`
    pub fn checker(&self, check_type: CheckType) -> &dyn HealthChecker {
        match check_type {
            CheckType::Http => &self.http,
            CheckType::Tcp => &self.tcp,
        }
    }
}

#[async_trait]
impl HealthChecker for CheckerSet {
    async fn check(&self, target: &CheckTarget) -> HealthCheckResult {
        self.checker(target.check_type).check(target).await
    }

    fn name(&self) -> &str {
        "dispatch"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CheckStatus;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_checker_refused() {
        // Nothing listens on port 1
        let target = CheckTarget::new(CheckType::Tcp, "127.0.0.1", 1)
            .with_timeout(Duration::from_millis(100));

        let result = TcpChecker::new().check(&target).await;
        assert!(!result.is_healthy());
        assert!(result.duration <= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_tcp_checker_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let target = CheckTarget::new(CheckType::Tcp, "127.0.0.1", port)
            .with_timeout(Duration::from_secs(1));

        let result = TcpChecker::new().check(&target).await;
        assert!(result.is_healthy());
    }

    #[tokio::test]
    async fn test_http_checker_2xx() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
                    .await;
            }
        });

        let target = CheckTarget::new(CheckType::Http, "127.0.0.1", port)
            .with_timeout(Duration::from_secs(2));

        let result = CheckerSet::new().unwrap().check(&target).await;
        assert!(result.is_healthy(), "unexpected result: {:?}", result);
        assert_eq!(result.response_code, Some(204));
    }

    #[tokio::test]
    async fn test_http_checker_unreachable() {
        let target = CheckTarget::new(CheckType::Http, "127.0.0.1", 1)
            .with_timeout(Duration::from_millis(100));

        let result = HttpChecker::new().unwrap().check(&target).await;
        assert!(matches!(
            result.status,
            CheckStatus::Error | CheckStatus::Timeout
        ));
        assert!(result.duration <= Duration::from_millis(300));
    }

    #[test]
    fn test_checker_set_dispatch() {
        let set = CheckerSet::new().unwrap();
        assert_eq!(set.checker(CheckType::Http).name(), "http");
        assert_eq!(set.checker(CheckType::Tcp).name(), "tcp");
    }
}
