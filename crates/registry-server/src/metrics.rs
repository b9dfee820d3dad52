//! Prometheus metrics for the registry server.

use healthcheck::HealthCheckStats;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use registry::{EventType, HealthStatus, ServiceEvent, SweepSummary};
use std::sync::atomic::AtomicU64;

/// Labels for event metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    /// Event type (INSTANCE_REGISTER, INSTANCE_HEALTH_CHANGE, ...)
    pub event_type: String,
    /// Emitting component (registry-service, health-monitor)
    pub source: String,
}

/// Labels for health transition metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub source: String,
    /// New health status
    pub to: String,
}

/// Labels for event log batch metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BatchTriggerLabels {
    /// Trigger reason (size_limit, time_delay, shutdown)
    pub trigger: String,
}

/// Metrics registry with all registry server metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    events_total: Family<EventLabels, Counter>,
    health_transitions_total: Family<TransitionLabels, Counter>,
    evictions_total: Counter,

    subscribers_active: Gauge,
    subscriber_dropped_events: Gauge,

    // Monitor stats, mirrored from the monitor's own counters
    monitor_checks: Gauge,
    monitor_checks_failed: Gauge,
    monitor_timeouts: Gauge,
    monitor_response_time_seconds: Gauge<f64, AtomicU64>,
    monitor_active_instances: Gauge,
    monitor_sweep_duration_seconds: Gauge<f64, AtomicU64>,

    event_log_batches_total: Family<BatchTriggerLabels, Counter>,
    event_log_batch_size: Histogram,
    event_log_dropped_total: Counter,
    event_log_errors_total: Counter,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let events_total = Family::<EventLabels, Counter>::default();
        registry.register(
            "registry_events",
            "Registry events published by type",
            events_total.clone(),
        );

        let health_transitions_total = Family::<TransitionLabels, Counter>::default();
        registry.register(
            "registry_health_transitions",
            "Instance health status transitions",
            health_transitions_total.clone(),
        );

        let evictions_total = Counter::default();
        registry.register(
            "registry_evictions",
            "Temporary instances evicted by the health monitor",
            evictions_total.clone(),
        );

        let subscribers_active = Gauge::default();
        registry.register(
            "registry_subscribers_active",
            "Live local event subscriptions",
            subscribers_active.clone(),
        );

        let subscriber_dropped_events = Gauge::default();
        registry.register(
            "registry_subscriber_dropped_events",
            "Events dropped because a subscriber buffer was full",
            subscriber_dropped_events.clone(),
        );

        let monitor_checks = Gauge::default();
        registry.register(
            "registry_monitor_checks",
            "Health checks performed since start",
            monitor_checks.clone(),
        );

        let monitor_checks_failed = Gauge::default();
        registry.register(
            "registry_monitor_checks_failed",
            "Failed health checks since start",
            monitor_checks_failed.clone(),
        );

        let monitor_timeouts = Gauge::default();
        registry.register(
            "registry_monitor_timeouts",
            "Timed out probes since start",
            monitor_timeouts.clone(),
        );

        let monitor_response_time_seconds = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "registry_monitor_response_time_seconds",
            "Moving average of probe response time",
            monitor_response_time_seconds.clone(),
        );

        let monitor_active_instances = Gauge::default();
        registry.register(
            "registry_monitor_active_instances",
            "Instances seen by the most recent sweep",
            monitor_active_instances.clone(),
        );

        let monitor_sweep_duration_seconds = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "registry_monitor_sweep_duration_seconds",
            "Duration of the most recent sweep",
            monitor_sweep_duration_seconds.clone(),
        );

        let event_log_batches_total = Family::<BatchTriggerLabels, Counter>::default();
        registry.register(
            "registry_event_log_batches",
            "Event log batches written",
            event_log_batches_total.clone(),
        );

        let event_log_batch_size = Histogram::new(exponential_buckets(1.0, 2.0, 12));
        registry.register(
            "registry_event_log_batch_size",
            "Events per event log batch",
            event_log_batch_size.clone(),
        );

        let event_log_dropped_total = Counter::default();
        registry.register(
            "registry_event_log_dropped",
            "Events not logged because the event log channel was full",
            event_log_dropped_total.clone(),
        );

        let event_log_errors_total = Counter::default();
        registry.register(
            "registry_event_log_errors",
            "Event log batches that failed to write",
            event_log_errors_total.clone(),
        );

        Self {
            registry,
            events_total,
            health_transitions_total,
            evictions_total,
            subscribers_active,
            subscriber_dropped_events,
            monitor_checks,
            monitor_checks_failed,
            monitor_timeouts,
            monitor_response_time_seconds,
            monitor_active_instances,
            monitor_sweep_duration_seconds,
            event_log_batches_total,
            event_log_batch_size,
            event_log_dropped_total,
            event_log_errors_total,
        }
    }

    /// Record a published event
    pub fn record_event(&self, event: &ServiceEvent) {
        self.events_total
            .get_or_create(&EventLabels {
                event_type: event.event_type.as_str().to_string(),
                source: event.source.clone(),
            })
            .inc();

        match event.event_type {
            EventType::InstanceHealthChange => {
                let to = event
                    .instance
                    .as_ref()
                    .map(|instance| instance.health_status)
                    .unwrap_or(HealthStatus::Unknown);
                self.health_transitions_total
                    .get_or_create(&TransitionLabels {
                        source: event.source.clone(),
                        to: to.to_string(),
                    })
                    .inc();
            }
            EventType::InstanceDeregistered => {
                self.evictions_total.inc();
            }
            _ => {}
        }
    }

    pub fn update_subscribers(&self, active: usize, dropped_events: u64) {
        self.subscribers_active.set(active as i64);
        self.subscriber_dropped_events.set(dropped_events as i64);
    }

    pub fn update_monitor_stats(&self, stats: &HealthCheckStats) {
        self.monitor_checks.set(stats.total_checks as i64);
        self.monitor_checks_failed.set(stats.failed_checks as i64);
        self.monitor_timeouts.set(stats.timeouts as i64);
        self.monitor_response_time_seconds
            .set(stats.avg_response_time_ms / 1000.0);
        self.monitor_active_instances
            .set(stats.active_instances as i64);
    }

    pub fn update_sweep(&self, summary: &SweepSummary) {
        self.monitor_sweep_duration_seconds
            .set(summary.duration.as_secs_f64());
    }

    pub fn record_batch_written(&self, size: usize, trigger: &str) {
        self.event_log_batches_total
            .get_or_create(&BatchTriggerLabels {
                trigger: trigger.to_string(),
            })
            .inc();
        self.event_log_batch_size.observe(size as f64);
    }

    pub fn record_event_log_drop(&self) {
        self.event_log_dropped_total.inc();
    }

    pub fn record_event_log_error(&self) {
        self.event_log_errors_total.inc();
    }

    /// Encode every metric in Prometheus text format
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry::ServiceInstance;
    use std::time::Duration;

    fn instance() -> ServiceInstance {
        let mut instance = ServiceInstance::new("acme", "orders", "biz", "10.0.0.1", 8080);
        instance.service_instance_id = "i-1".to_string();
        instance
    }

    #[test]
    fn test_record_event_by_type() {
        let metrics = MetricsRegistry::new();
        metrics.record_event(&ServiceEvent::register(&instance()));
        metrics.record_event(&ServiceEvent::register(&instance()));

        let text = metrics.encode().unwrap();
        assert!(text.contains(
            r#"registry_events_total{event_type="INSTANCE_REGISTER",source="registry-service"} 2"#
        ));
    }

    #[test]
    fn test_health_transitions_and_evictions() {
        let metrics = MetricsRegistry::new();
        let mut unhealthy = instance();
        unhealthy.health_status = HealthStatus::Unhealthy;
        unhealthy.heartbeat_fail_count = 3;

        metrics.record_event(&ServiceEvent::health_change(
            &unhealthy,
            "health-monitor",
            HealthStatus::Healthy,
        ));
        metrics.record_event(&ServiceEvent::evicted(&unhealthy, "heartbeat timeout"));

        let text = metrics.encode().unwrap();
        assert!(text.contains(
            r#"registry_health_transitions_total{source="health-monitor",to="UNHEALTHY"} 1"#
        ));
        assert!(text.contains("registry_evictions_total 1"));
    }

    #[test]
    fn test_gauges() {
        let metrics = MetricsRegistry::new();
        metrics.update_subscribers(3, 42);
        metrics.update_monitor_stats(&HealthCheckStats {
            total_checks: 10,
            successful_checks: 8,
            failed_checks: 2,
            timeouts: 1,
            avg_response_time_ms: 250.0,
            active_instances: 4,
        });
        metrics.update_sweep(&SweepSummary {
            duration: Duration::from_millis(500),
            ..Default::default()
        });

        let text = metrics.encode().unwrap();
        assert!(text.contains("registry_subscribers_active 3"));
        assert!(text.contains("registry_subscriber_dropped_events 42"));
        assert!(text.contains("registry_monitor_checks_failed 2"));
        assert!(text.contains("registry_monitor_response_time_seconds 0.25"));
        assert!(text.contains("registry_monitor_sweep_duration_seconds 0.5"));
    }

    #[test]
    fn test_event_log_metrics() {
        let metrics = MetricsRegistry::new();
        metrics.record_batch_written(50, "size_limit");
        metrics.record_batch_written(3, "time_delay");
        metrics.record_event_log_drop();
        metrics.record_event_log_error();

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"registry_event_log_batches_total{trigger="size_limit"} 1"#));
        assert!(text.contains("registry_event_log_dropped_total 1"));
        assert!(text.contains("registry_event_log_errors_total 1"));
    }
}
