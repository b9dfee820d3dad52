//! Publisher decorator feeding metrics and the event log.

use crate::metrics::MetricsRegistry;
use async_trait::async_trait;
use common::Result;
use registry::{EventPublisher, ServiceEvent};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Wraps an [`EventPublisher`], recording every published event and copying
/// it to the event log channel. The copy never waits: a full channel drops
/// the log entry and counts it.
pub struct RecordingPublisher {
    inner: Arc<dyn EventPublisher>,
    metrics: Option<Arc<MetricsRegistry>>,
    /// Taken on close so the event log can drain and stop
    event_log: Mutex<Option<mpsc::Sender<Arc<ServiceEvent>>>>,
}

impl RecordingPublisher {
    pub fn new(
        inner: Arc<dyn EventPublisher>,
        metrics: Option<Arc<MetricsRegistry>>,
        event_log: Option<mpsc::Sender<Arc<ServiceEvent>>>,
    ) -> Self {
        Self {
            inner,
            metrics,
            event_log: Mutex::new(event_log),
        }
    }

    fn log_event(&self, event: &ServiceEvent) {
        let sender = match self.event_log.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(sender) = sender else {
            return;
        };

        match sender.try_send(Arc::new(event.clone())) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(event_id = %event.event_id, "Event log full, dropping entry");
                if let Some(ref m) = self.metrics {
                    m.record_event_log_drop();
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(event_id = %event.event_id, "Event log closed");
            }
        }
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: ServiceEvent) -> Result<()> {
        if let Some(ref m) = self.metrics {
            m.record_event(&event);
        }
        self.log_event(&event);
        self.inner.publish(event).await
    }

    async fn subscribe(
        &self,
        tenant_id: &str,
        service_name: &str,
        group_name: &str,
    ) -> Result<broadcast::Receiver<Arc<ServiceEvent>>> {
        self.inner
            .subscribe(tenant_id, service_name, group_name)
            .await
    }

    async fn unsubscribe(
        &self,
        tenant_id: &str,
        service_name: &str,
        group_name: &str,
    ) -> Result<()> {
        self.inner
            .unsubscribe(tenant_id, service_name, group_name)
            .await
    }

    async fn close(&self) -> Result<()> {
        let sender = match self.event_log.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        // Last sender gone: the event log flushes and exits
        drop(sender);
        self.inner.close().await
    }

    /// Reopens the inner publisher only. The event log stays detached once
    /// it has drained.
    async fn reopen(&self) -> Result<()> {
        self.inner.reopen().await
    }
}
