//! Health monitoring and eviction of registered instances.
//!
//! One shared ticker drives a sweep over every tenant, group, service and
//! instance found in the cache. Per service the monitor either probes the
//! instances (`ACTIVE`) or only judges heartbeat freshness (`PASSIVE`).
//! Temporary instances that fail `failure_threshold` checks in a row are
//! removed; persistent instances are only ever marked unhealthy.

use crate::config::HealthMonitorConfig;
use crate::event::{SOURCE_HEALTH_MONITOR, ServiceEvent};
use crate::model::{HealthCheckMode, HealthStatus, Service, ServiceInstance};
use crate::storage::{CacheStorage, EventPublisher};
use common::{Error, Result, ResultExt};
use futures::StreamExt;
use futures::stream;
use healthcheck::{CheckTarget, CheckerSet, HealthCheckResult, HealthCheckStats, HealthChecker};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Slack on top of the probe timeout before the monitor gives up on a checker.
const PROBE_GRACE: Duration = Duration::from_millis(500);

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub tenants: usize,
    /// Tenants skipped because groups or services could not be listed
    pub failed_tenants: usize,
    pub services: usize,
    /// Instances still registered after the sweep
    pub instances: usize,
    pub evicted: usize,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct ServiceOutcome {
    instances: usize,
    evicted: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum InstanceOutcome {
    /// Nothing was due this tick
    Skipped,
    Checked,
    Evicted,
}

#[derive(Debug)]
enum Verdict {
    Passed,
    Failed(String),
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic health checker for every registered instance.
pub struct HealthMonitor {
    cache: Arc<dyn CacheStorage>,
    publisher: Arc<dyn EventPublisher>,
    checker: Arc<dyn HealthChecker>,
    /// Check rules, read once per sweep
    config: RwLock<HealthMonitorConfig>,
    /// Kept apart from `config` so reporting never waits on the sweep
    stats: Mutex<HealthCheckStats>,
    last_sweep: Mutex<Option<SweepSummary>>,
    worker: tokio::sync::Mutex<Option<Worker>>,
}

impl HealthMonitor {
    pub fn new(
        cache: Arc<dyn CacheStorage>,
        publisher: Arc<dyn EventPublisher>,
        checker: Arc<dyn HealthChecker>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            cache,
            publisher,
            checker,
            config: RwLock::new(config),
            stats: Mutex::new(HealthCheckStats::default()),
            last_sweep: Mutex::new(None),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// Monitor using the built-in HTTP and TCP checkers.
    pub fn with_default_checkers(
        cache: Arc<dyn CacheStorage>,
        publisher: Arc<dyn EventPublisher>,
        config: HealthMonitorConfig,
    ) -> Result<Self> {
        let checkers = CheckerSet::new().map_err(Error::healthcheck)?;
        Ok(Self::new(cache, publisher, Arc::new(checkers), config))
    }

    /// Spawn the sweep loop. Fails if it is already running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Err(Error::AlreadyRunning("health monitor".to_string()));
        }

        let cancel = CancellationToken::new();
        let monitor = Arc::clone(self);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            monitor.run(loop_cancel).await;
        });

        *worker = Some(Worker { cancel, handle });
        info!(tick_ms = self.tick_interval().as_millis() as u64, "Health monitor started");
        Ok(())
    }

    /// Signal the loop to stop and wait for it, bounded by the shutdown grace.
    /// Exceeding the grace is logged and the loop is aborted.
    pub async fn stop(&self) -> Result<()> {
        let Some(Worker { cancel, mut handle }) = self.worker.lock().await.take() else {
            debug!("Health monitor not running");
            return Ok(());
        };

        cancel.cancel();
        let grace = self.config_snapshot().shutdown_grace;
        match timeout(grace, &mut handle).await {
            Ok(Ok(())) => info!("Health monitor stopped"),
            Ok(Err(e)) => warn!(error = %e, "Health monitor task ended abnormally"),
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs(),
                    "Timed out waiting for health monitor to stop"
                );
                handle.abort();
            }
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Change the default check interval. The running loop picks up the new
    /// tick after its current wait.
    pub fn set_check_interval(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::validation("check_interval", "must be greater than zero"));
        }
        match self.config.write() {
            Ok(mut config) => {
                config.default_check_interval = interval;
                info!(interval_secs = interval.as_secs(), "Default check interval updated");
                Ok(())
            }
            Err(_) => Err(Error::other("health monitor configuration poisoned")),
        }
    }

    pub fn get_stats(&self) -> HealthCheckStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Summary of the most recent sweep, `None` before the first one.
    pub fn last_sweep(&self) -> Option<SweepSummary> {
        self.last_sweep
            .lock()
            .map(|last| last.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn config_snapshot(&self) -> HealthMonitorConfig {
        self.config
            .read()
            .map(|config| config.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn tick_interval(&self) -> Duration {
        self.config_snapshot().tick_interval()
    }

    fn with_stats(&self, update: impl FnOnce(&mut HealthCheckStats)) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut stats);
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = self.tick_interval();
        // First sweep after one full tick
        let mut ticker = interval_at(tokio::time::Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => break,
                        summary = self.sweep() => {
                            debug!(
                                tenants = summary.tenants,
                                services = summary.services,
                                instances = summary.instances,
                                evicted = summary.evicted,
                                duration_ms = summary.duration.as_millis() as u64,
                                "Sweep finished"
                            );
                        }
                    }
                }
            }

            let desired = self.tick_interval();
            if desired != tick {
                info!(
                    old_ms = tick.as_millis() as u64,
                    new_ms = desired.as_millis() as u64,
                    "Health monitor tick changed"
                );
                tick = desired;
                ticker = interval_at(tokio::time::Instant::now() + tick, tick);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
        }

        info!("Health monitor loop exiting");
    }

    /// Run one pass over every tenant. Used by the loop on each tick.
    pub async fn sweep(&self) -> SweepSummary {
        let started = Instant::now();
        let config = self.config_snapshot();
        let mut summary = SweepSummary::default();

        let tenants = match self.cache.list_tenant_ids().await {
            Ok(tenants) => tenants,
            Err(e) => {
                warn!(error = %e, "Failed to list tenants, skipping sweep");
                summary.duration = started.elapsed();
                return summary;
            }
        };
        summary.tenants = tenants.len();

        for tenant_id in &tenants {
            let services = match self.collect_services(tenant_id).await {
                Ok(services) => services,
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "Skipping tenant for this sweep");
                    summary.failed_tenants += 1;
                    continue;
                }
            };
            summary.services += services.len();

            let outcomes: Vec<ServiceOutcome> = stream::iter(services)
                .map(|service| self.check_service(service, &config))
                .buffer_unordered(config.max_concurrent_services.max(1))
                .collect()
                .await;

            for outcome in outcomes {
                summary.instances += outcome.instances;
                summary.evicted += outcome.evicted;
            }
        }

        self.with_stats(|stats| stats.active_instances = summary.instances);
        summary.duration = started.elapsed();
        if let Ok(mut last) = self.last_sweep.lock() {
            *last = Some(summary.clone());
        }
        summary
    }

    async fn collect_services(&self, tenant_id: &str) -> Result<Vec<Service>> {
        let groups = self
            .cache
            .list_service_groups(tenant_id)
            .await
            .context("list service groups")?;

        let mut services = Vec::new();
        for group in groups {
            let found = self
                .cache
                .list_services(tenant_id, &group.group_name)
                .await
                .context(format!("list services of group {}", group.group_name))?;
            services.extend(found);
        }
        Ok(services)
    }

    async fn check_service(&self, service: Service, config: &HealthMonitorConfig) -> ServiceOutcome {
        let mut outcome = ServiceOutcome::default();

        let instances = match self
            .cache
            .list_instances(&service.tenant_id, &service.group_name, &service.service_name)
            .await
        {
            Ok(instances) => instances,
            Err(e) => {
                warn!(
                    tenant_id = %service.tenant_id,
                    service_name = %service.service_name,
                    group_name = %service.group_name,
                    error = %e,
                    "Failed to list instances"
                );
                return outcome;
            }
        };

        for instance in instances {
            let instance_id = instance.service_instance_id.clone();
            match self.check_instance(&service, instance, config).await {
                Ok(InstanceOutcome::Evicted) => outcome.evicted += 1,
                Ok(_) => outcome.instances += 1,
                Err(e) => {
                    outcome.instances += 1;
                    warn!(
                        tenant_id = %service.tenant_id,
                        instance_id = %instance_id,
                        error = %e,
                        "Failed to update instance health state"
                    );
                }
            }
        }

        outcome
    }

    async fn check_instance(
        &self,
        service: &Service,
        mut instance: ServiceInstance,
        config: &HealthMonitorConfig,
    ) -> Result<InstanceOutcome> {
        let now = SystemTime::now();
        let interval = service.check_interval(config.default_check_interval);
        let heartbeat_timeout = config.heartbeat_timeout(interval);
        let heartbeat_age = instance.heartbeat_age(now);
        let heartbeat_expired = heartbeat_age.is_some_and(|age| age > heartbeat_timeout);
        let timeout_reason = || {
            format!(
                "heartbeat timeout: last heartbeat {}s ago, limit {}s",
                heartbeat_age.unwrap_or_default().as_secs(),
                heartbeat_timeout.as_secs()
            )
        };

        let verdict = match service.health_check_mode {
            HealthCheckMode::Passive => {
                let verdict = if heartbeat_expired {
                    Verdict::Failed(timeout_reason())
                } else {
                    Verdict::Passed
                };
                self.record_passive(&verdict);
                verdict
            }
            HealthCheckMode::Active => {
                let probe_due = instance.check_age(now).is_none_or(|age| age >= interval);
                if probe_due {
                    let result = self.probe(service, &instance, config).await;
                    instance.last_health_check_time = Some(SystemTime::now());
                    self.with_stats(|stats| stats.update(&result));
                    if result.is_healthy() {
                        Verdict::Passed
                    } else {
                        Verdict::Failed(format!("health check failed: {}", result.describe()))
                    }
                } else if instance.temp_instance && heartbeat_expired {
                    let verdict = Verdict::Failed(timeout_reason());
                    self.record_passive(&verdict);
                    verdict
                } else {
                    return Ok(InstanceOutcome::Skipped);
                }
            }
        };

        let old_health = instance.health_status;
        let mut heartbeat_refreshed = false;
        let failure_reason = match verdict {
            Verdict::Passed => {
                instance.heartbeat_fail_count = 0;
                instance.health_status = HealthStatus::Healthy;
                // A passing probe also counts as a heartbeat
                if service.health_check_mode == HealthCheckMode::Active
                    && heartbeat_age.is_none_or(|age| age > interval)
                {
                    instance.last_heartbeat_time = Some(SystemTime::now());
                    heartbeat_refreshed = true;
                }
                None
            }
            Verdict::Failed(reason) => {
                instance.heartbeat_fail_count = instance.heartbeat_fail_count.saturating_add(1);
                instance.health_status = HealthStatus::Unhealthy;
                debug!(
                    tenant_id = %instance.tenant_id,
                    instance_id = %instance.service_instance_id,
                    fail_count = instance.heartbeat_fail_count,
                    reason = %reason,
                    "Instance check failed"
                );
                Some(reason)
            }
        };
        instance.audit.touch(SOURCE_HEALTH_MONITOR);

        self.cache
            .set_instance(&instance.tenant_id, &instance)
            .await
            .context("write back instance state")?;

        match service.health_check_mode {
            HealthCheckMode::Passive => {
                let message = failure_reason
                    .clone()
                    .unwrap_or_else(|| "heartbeat within timeout".to_string());
                self.publish(ServiceEvent::heartbeat_checked(&instance, message))
                    .await;
            }
            HealthCheckMode::Active if heartbeat_refreshed => {
                self.publish(ServiceEvent::heartbeat_checked(
                    &instance,
                    "heartbeat refreshed by passing health check",
                ))
                .await;
            }
            HealthCheckMode::Active => {}
        }

        if old_health != instance.health_status {
            info!(
                tenant_id = %instance.tenant_id,
                instance_id = %instance.service_instance_id,
                old_status = %old_health,
                new_status = %instance.health_status,
                "Instance health changed"
            );
            self.publish(ServiceEvent::health_change(
                &instance,
                SOURCE_HEALTH_MONITOR,
                old_health,
            ))
            .await;
        }

        if let Some(reason) = failure_reason {
            if instance.temp_instance && instance.heartbeat_fail_count >= config.failure_threshold {
                self.cache
                    .remove_instance(&instance.tenant_id, &instance.service_instance_id)
                    .await
                    .context("evict instance")?;

                warn!(
                    tenant_id = %instance.tenant_id,
                    instance_id = %instance.service_instance_id,
                    service_name = %instance.service_name,
                    fail_count = instance.heartbeat_fail_count,
                    reason = %reason,
                    "Evicted temporary instance"
                );
                self.publish(ServiceEvent::evicted(&instance, &reason)).await;
                return Ok(InstanceOutcome::Evicted);
            }
        }

        Ok(InstanceOutcome::Checked)
    }

    async fn probe(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        config: &HealthMonitorConfig,
    ) -> HealthCheckResult {
        let Ok(port) = u16::try_from(instance.port_number) else {
            return HealthCheckResult::error(
                Duration::ZERO,
                format!("invalid port {}", instance.port_number),
            );
        };

        let target = CheckTarget::new(service.health_check_type, &instance.host_address, port)
            .with_context_path(&instance.context_path)
            .with_path(&service.health_check_url)
            .with_timeout(service.check_timeout(config.default_timeout));

        match timeout(target.timeout + PROBE_GRACE, self.checker.check(&target)).await {
            Ok(result) => result,
            Err(_) => HealthCheckResult::timeout(target.timeout),
        }
    }

    fn record_passive(&self, verdict: &Verdict) {
        self.with_stats(|stats| match verdict {
            Verdict::Passed => stats.record_success(),
            Verdict::Failed(_) => stats.record_failure(),
        });
    }

    async fn publish(&self, event: ServiceEvent) {
        let event_type = event.event_type;
        if let Err(e) = self.publisher.publish(event).await {
            warn!(event_type = %event_type, error = %e, "Failed to publish event");
        }
    }
}
