//! Integration tests for HealthMonitor

use async_trait::async_trait;
use healthcheck::{CheckTarget, HealthCheckResult, HealthChecker};
use registry::{
    BroadcastEventPublisher, EventPublisher, EventType, HealthCheckMode, HealthMonitor,
    HealthMonitorConfig, HealthStatus, MemoryStorage, RegistryOptions, RegistryService,
    ServiceEvent, ServiceInstance, Storage,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

/// Checker answering from a script, healthy once the script runs out
#[derive(Default)]
struct ScriptedChecker {
    script: Mutex<VecDeque<bool>>,
    calls: AtomicUsize,
    targets: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedChecker {
    fn answering(script: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            ..Default::default()
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthChecker for ScriptedChecker {
    async fn check(&self, target: &CheckTarget) -> HealthCheckResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().unwrap().push(target.url());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let healthy = self.script.lock().unwrap().pop_front().unwrap_or(true);
        if healthy {
            HealthCheckResult::healthy(Duration::from_millis(2))
        } else {
            HealthCheckResult::unhealthy(Duration::from_millis(2), "HTTP 503")
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct Harness {
    storage: Arc<MemoryStorage>,
    publisher: Arc<BroadcastEventPublisher>,
    registry: RegistryService,
    monitor: Arc<HealthMonitor>,
}

async fn harness(checker: Arc<ScriptedChecker>) -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let publisher = Arc::new(BroadcastEventPublisher::default());
    let registry = RegistryService::new(
        storage.clone(),
        publisher.clone(),
        RegistryOptions::default(),
    );
    registry.start().await;
    let monitor = Arc::new(HealthMonitor::new(
        storage.clone(),
        publisher.clone(),
        checker,
        HealthMonitorConfig::default(),
    ));
    Harness {
        storage,
        publisher,
        registry,
        monitor,
    }
}

impl Harness {
    async fn register(&self, instance: ServiceInstance) -> String {
        assert_ok!(self.registry.register(instance).await).service_instance_id
    }

    async fn set_mode(&self, mode: HealthCheckMode) {
        let mut service = assert_ok!(self.storage.get_service("acme", "biz", "orders").await);
        service.health_check_mode = mode;
        assert_ok!(self.storage.save_service(&service).await);
    }

    async fn edit(&self, id: &str, edit: impl FnOnce(&mut ServiceInstance)) {
        let mut instance = assert_ok!(self.storage.get_instance("acme", id).await);
        edit(&mut instance);
        assert_ok!(self.storage.save_instance(&instance).await);
    }

    async fn instance(&self, id: &str) -> ServiceInstance {
        assert_ok!(self.storage.get_instance("acme", id).await)
    }

    async fn events(&self) -> broadcast::Receiver<Arc<ServiceEvent>> {
        assert_ok!(self.publisher.subscribe("acme", "orders", "biz").await)
    }
}

fn orders(host: &str) -> ServiceInstance {
    ServiceInstance::new("acme", "orders", "biz", host, 8080)
}

fn ago(secs: u64) -> Option<SystemTime> {
    Some(SystemTime::now() - Duration::from_secs(secs))
}

fn drain(rx: &mut broadcast::Receiver<Arc<ServiceEvent>>) -> Vec<Arc<ServiceEvent>> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_passive_evicts_stale_temporary_instance() {
    let h = harness(ScriptedChecker::answering(&[])).await;
    let id = h.register(orders("10.0.0.1").ephemeral()).await;
    h.set_mode(HealthCheckMode::Passive).await;
    h.edit(&id, |i| i.last_heartbeat_time = ago(91)).await;
    let mut rx = h.events().await;

    h.monitor.sweep().await;
    let after_first = h.instance(&id).await;
    assert_eq!(after_first.heartbeat_fail_count, 1);
    assert_eq!(after_first.health_status, HealthStatus::Unhealthy);

    h.monitor.sweep().await;
    assert_eq!(h.instance(&id).await.heartbeat_fail_count, 2);

    let summary = h.monitor.sweep().await;
    assert_eq!(summary.evicted, 1);
    assert!(assert_err!(h.storage.get_instance("acme", &id).await).is_not_found());

    let events = drain(&mut rx);
    let evicted: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::InstanceDeregistered)
        .collect();
    assert_eq!(evicted.len(), 1);
    assert!(evicted[0].message.contains("heartbeat timeout"));
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type == EventType::InstanceHealthChange)
            .count(),
        1
    );
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type == EventType::HeartbeatUpdated)
            .count(),
        3
    );
}

#[tokio::test]
async fn test_passive_keeps_persistent_instance() {
    let h = harness(ScriptedChecker::answering(&[])).await;
    let id = h.register(orders("10.0.0.1")).await;
    h.set_mode(HealthCheckMode::Passive).await;
    h.edit(&id, |i| i.last_heartbeat_time = ago(120)).await;

    for _ in 0..4 {
        h.monitor.sweep().await;
    }

    let instance = h.instance(&id).await;
    assert_eq!(instance.health_status, HealthStatus::Unhealthy);
    assert_eq!(instance.heartbeat_fail_count, 4);
    assert_eq!(h.storage.instance_count(), 1);
}

#[tokio::test]
async fn test_passive_fresh_heartbeat_recovers() {
    let h = harness(ScriptedChecker::answering(&[])).await;
    let id = h.register(orders("10.0.0.1")).await;
    h.set_mode(HealthCheckMode::Passive).await;
    h.edit(&id, |i| {
        i.health_status = HealthStatus::Unhealthy;
        i.heartbeat_fail_count = 2;
    })
    .await;

    h.monitor.sweep().await;

    let instance = h.instance(&id).await;
    assert_eq!(instance.health_status, HealthStatus::Healthy);
    assert_eq!(instance.heartbeat_fail_count, 0);
}

#[tokio::test]
async fn test_active_success_resets_failures() {
    let checker = ScriptedChecker::answering(&[true]);
    let h = harness(checker.clone()).await;
    let id = h.register(orders("10.0.0.1").ephemeral()).await;
    h.edit(&id, |i| {
        i.heartbeat_fail_count = 2;
        i.health_status = HealthStatus::Unhealthy;
        i.context_path = "/api".to_string();
    })
    .await;
    let mut rx = h.events().await;

    let summary = h.monitor.sweep().await;

    assert_eq!(checker.calls(), 1);
    assert_eq!(
        checker.targets.lock().unwrap().as_slice(),
        ["http://10.0.0.1:8080/api/health"]
    );
    assert_eq!(summary.evicted, 0);
    let instance = h.instance(&id).await;
    assert_eq!(instance.heartbeat_fail_count, 0);
    assert_eq!(instance.health_status, HealthStatus::Healthy);
    assert!(instance.last_health_check_time.is_some());

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::InstanceHealthChange);
    assert_eq!(events[0].source, "health-monitor");
}

#[tokio::test]
async fn test_active_failures_evict_temporary_instance() {
    let checker = ScriptedChecker::answering(&[false, false, false]);
    let h = harness(checker.clone()).await;
    let id = h.register(orders("10.0.0.1").ephemeral()).await;
    let mut rx = h.events().await;

    for round in 1..=3 {
        // Make the probe due again
        if round > 1 {
            h.edit(&id, |i| i.last_health_check_time = ago(31)).await;
        }
        h.monitor.sweep().await;
    }

    assert_eq!(checker.calls(), 3);
    assert_eq!(h.storage.instance_count(), 0);
    let evicted = drain(&mut rx)
        .into_iter()
        .find(|e| e.event_type == EventType::InstanceDeregistered)
        .expect("eviction event");
    assert!(evicted.message.contains("health check failed"));
}

#[tokio::test]
async fn test_active_probe_is_rate_limited() {
    let checker = ScriptedChecker::answering(&[]);
    let h = harness(checker.clone()).await;
    h.register(orders("10.0.0.1")).await;

    h.monitor.sweep().await;
    h.monitor.sweep().await;

    assert_eq!(checker.calls(), 1);
}

#[tokio::test]
async fn test_rate_limited_temporary_instance_still_times_out() {
    let checker = ScriptedChecker::answering(&[]);
    let h = harness(checker.clone()).await;
    let id = h.register(orders("10.0.0.1").ephemeral()).await;
    h.edit(&id, |i| {
        i.last_health_check_time = Some(SystemTime::now());
        i.last_heartbeat_time = ago(91);
    })
    .await;

    for _ in 0..3 {
        h.monitor.sweep().await;
    }

    assert_eq!(checker.calls(), 0);
    assert_eq!(h.storage.instance_count(), 0);
}

#[tokio::test]
async fn test_passing_probe_refreshes_stale_heartbeat() {
    let h = harness(ScriptedChecker::answering(&[true])).await;
    let id = h.register(orders("10.0.0.1")).await;
    h.edit(&id, |i| i.last_heartbeat_time = ago(45)).await;
    let mut rx = h.events().await;

    h.monitor.sweep().await;

    let instance = h.instance(&id).await;
    let age = instance
        .heartbeat_age(SystemTime::now())
        .expect("heartbeat set");
    assert!(age < Duration::from_secs(5));
    assert!(
        drain(&mut rx)
            .iter()
            .any(|e| e.event_type == EventType::HeartbeatUpdated)
    );
}

#[tokio::test]
async fn test_stats_follow_sweeps() {
    let checker = ScriptedChecker::answering(&[true, false]);
    let h = harness(checker).await;
    h.register(orders("10.0.0.1")).await;
    h.register(orders("10.0.0.2")).await;

    let summary = h.monitor.sweep().await;
    assert_eq!(summary.tenants, 1);
    assert_eq!(summary.services, 1);
    assert_eq!(summary.instances, 2);

    let stats = h.monitor.get_stats();
    assert_eq!(stats.total_checks, 2);
    assert_eq!(stats.successful_checks, 1);
    assert_eq!(stats.failed_checks, 1);
    assert_eq!(stats.active_instances, 2);
    assert!(stats.avg_response_time_ms > 0.0);
}

#[tokio::test]
async fn test_start_stop_lifecycle() {
    let h = harness(ScriptedChecker::answering(&[])).await;

    assert_ok!(h.monitor.start().await);
    assert!(h.monitor.is_running().await);
    assert_err!(h.monitor.start().await);

    assert_ok!(h.monitor.set_check_interval(Duration::from_millis(20)));
    assert_err!(h.monitor.set_check_interval(Duration::ZERO));

    assert_ok!(h.monitor.stop().await);
    assert!(!h.monitor.is_running().await);
    assert_ok!(h.monitor.stop().await);

    assert_ok!(h.monitor.start().await);
    assert_ok!(h.monitor.stop().await);
}

#[tokio::test]
async fn test_running_loop_checks_instances() {
    let checker = ScriptedChecker::answering(&[]);
    let h = harness(checker.clone()).await;
    h.register(orders("10.0.0.1")).await;
    assert_ok!(h.monitor.set_check_interval(Duration::from_millis(20)));

    assert_ok!(h.monitor.start().await);
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.monitor.get_stats().total_checks == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timeout waiting for a sweep");
    assert_ok!(h.monitor.stop().await);

    assert!(checker.calls() >= 1);
}

#[tokio::test]
async fn test_heartbeat_during_check_is_kept() {
    let h = harness(ScriptedChecker::slow(Duration::from_millis(300))).await;
    let id = h.register(orders("10.0.0.1").ephemeral()).await;
    h.edit(&id, |i| i.last_heartbeat_time = ago(20)).await;

    let monitor = h.monitor.clone();
    let sweep = tokio::spawn(async move { monitor.sweep().await });

    // Heartbeat lands while the check is in flight
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_ok!(h.registry.heartbeat("acme", &id).await);
    let received = h.instance(&id).await.last_heartbeat_time;
    assert!(received > ago(5));

    let summary = assert_ok!(sweep.await);
    assert_eq!(summary.instances, 1);

    let after = h.instance(&id).await;
    assert!(after.last_heartbeat_time >= received);
    assert_eq!(after.heartbeat_fail_count, 0);
    assert_eq!(after.health_status, HealthStatus::Healthy);
    assert!(after.last_health_check_time.is_some());
}
