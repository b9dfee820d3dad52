// Benchmark to measure metrics overhead on the publish path
// Compare recording with metrics enabled vs disabled

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use healthcheck::HealthCheckStats;
use registry::{HealthStatus, ServiceEvent, ServiceInstance};
use registry_server::metrics::MetricsRegistry;
use std::hint::black_box;
use std::sync::Arc;

fn instance(n: usize) -> ServiceInstance {
    ServiceInstance::new("acme", format!("svc-{n}"), "biz", "10.0.0.1", 8080)
        .with_id(format!("i-{n}"))
}

fn bench_metrics_recording(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics_recording");
    let event = ServiceEvent::heartbeat(&instance(1));

    group.bench_function("disabled", |b| {
        let metrics: Option<Arc<MetricsRegistry>> = None;
        b.iter(|| {
            if let Some(ref m) = metrics {
                m.record_event(black_box(&event));
            }
        });
    });

    group.bench_function("enabled", |b| {
        let metrics = Some(Arc::new(MetricsRegistry::new()));
        b.iter(|| {
            if let Some(ref m) = metrics {
                m.record_event(black_box(&event));
            }
        });
    });

    group.finish();
}

fn bench_individual_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("individual_operations");
    let registry = MetricsRegistry::new();

    let mut unhealthy = instance(1);
    unhealthy.health_status = HealthStatus::Unhealthy;
    let health_change =
        ServiceEvent::health_change(&unhealthy, "health-monitor", HealthStatus::Healthy);

    group.bench_function("record_health_change", |b| {
        b.iter(|| registry.record_event(black_box(&health_change)));
    });

    group.bench_function("update_monitor_stats", |b| {
        let stats = HealthCheckStats {
            total_checks: 1000,
            successful_checks: 990,
            failed_checks: 10,
            timeouts: 2,
            avg_response_time_ms: 12.5,
            active_instances: 100,
        };
        b.iter(|| registry.update_monitor_stats(black_box(&stats)));
    });

    group.bench_function("record_batch_written", |b| {
        b.iter(|| registry.record_batch_written(black_box(10), black_box("size_limit")));
    });

    group.bench_function("encode", |b| {
        b.iter(|| black_box(registry.encode()));
    });

    group.finish();
}

fn bench_many_services(c: &mut Criterion) {
    let mut group = c.benchmark_group("many_services");
    let registry = MetricsRegistry::new();

    // Label cardinality stays fixed no matter how many services publish
    for num_services in [1, 10, 100] {
        let events: Vec<ServiceEvent> = (0..num_services)
            .map(|n| ServiceEvent::register(&instance(n)))
            .collect();
        group.bench_with_input(
            BenchmarkId::from_parameter(num_services),
            &events,
            |b, events| {
                b.iter(|| {
                    for event in events {
                        registry.record_event(black_box(event));
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_metrics_recording,
    bench_individual_operations,
    bench_many_services
);
criterion_main!(benches);
