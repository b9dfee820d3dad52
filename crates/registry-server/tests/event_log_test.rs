//! Integration tests for EventLog component

use registry::{ServiceEvent, ServiceInstance};
use registry_server::{EventLog, MetricsRegistry};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Helper to create a register event
fn event(n: u32) -> Arc<ServiceEvent> {
    let instance = ServiceInstance::new("acme", "orders", "biz", "10.0.0.1", 8080)
        .with_id(format!("i-{n}"));
    Arc::new(ServiceEvent::register(&instance))
}

fn spawn_log(
    path: &Path,
    batch_delay: Duration,
    max_batch: usize,
    metrics: Option<Arc<MetricsRegistry>>,
) -> (mpsc::Sender<Arc<ServiceEvent>>, JoinHandle<u64>) {
    let (tx, rx) = mpsc::channel(100);
    let log = EventLog::new(rx, path, batch_delay, max_batch, metrics);
    (tx, tokio::spawn(log.run()))
}

fn lines(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

async fn wait_for_lines(path: &Path, count: usize) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while lines(path).len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timeout waiting for event log");
}

#[tokio::test]
async fn test_event_log_batches_by_delay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let (tx, _handle) = spawn_log(&path, Duration::from_millis(10), 50, None);

    for i in 1..=3 {
        tx.send(event(i)).await.unwrap();
    }

    wait_for_lines(&path, 3).await;
    let written = lines(&path);
    assert_eq!(written.len(), 3);
    assert_eq!(written[0]["event_type"], "INSTANCE_REGISTER");
    assert_eq!(written[0]["instance_id"], "i-1");
    assert_eq!(written[2]["instance_id"], "i-3");
}

#[tokio::test]
async fn test_event_log_writes_full_batch_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let metrics = Arc::new(MetricsRegistry::new());
    // Long delay, small batch
    let (tx, _handle) = spawn_log(&path, Duration::from_secs(5), 3, Some(metrics.clone()));

    for i in 1..=3 {
        tx.send(event(i)).await.unwrap();
    }

    wait_for_lines(&path, 3).await;
    let text = metrics.encode().unwrap();
    assert!(text.contains(r#"registry_event_log_batches_total{trigger="size_limit"} 1"#));
}

#[tokio::test]
async fn test_event_log_drains_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let (tx, handle) = spawn_log(&path, Duration::from_secs(5), 100, None);

    for i in 1..=5 {
        tx.send(event(i)).await.unwrap();
    }
    drop(tx);

    let written = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("Timeout waiting for event log to stop")
        .unwrap();
    assert_eq!(written, 5);
    assert_eq!(lines(&path).len(), 5);
}

#[tokio::test]
async fn test_event_log_appends_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");

    for round in 0..2 {
        let (tx, handle) = spawn_log(&path, Duration::from_millis(10), 10, None);
        tx.send(event(round)).await.unwrap();
        drop(tx);
        handle.await.unwrap();
    }

    assert_eq!(lines(&path).len(), 2);
}

#[tokio::test]
async fn test_event_log_write_failure_is_counted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing-dir").join("events.jsonl");
    let metrics = Arc::new(MetricsRegistry::new());
    let (tx, handle) = spawn_log(&path, Duration::from_millis(10), 10, Some(metrics.clone()));

    tx.send(event(1)).await.unwrap();
    drop(tx);

    assert_eq!(handle.await.unwrap(), 0);
    assert!(
        metrics
            .encode()
            .unwrap()
            .contains("registry_event_log_errors_total 1")
    );
}
