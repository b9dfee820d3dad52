//! Event log that batches registry events and appends them as JSON lines.

use crate::metrics::MetricsRegistry;
use registry::ServiceEvent;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

/// Batches events and appends them to a file, one JSON object per line.
///
/// A batch is written when it reaches `max_batch` events or when
/// `batch_delay` has passed since the last write. The log drains and exits
/// once every sender is dropped.
pub struct EventLog {
    events_rx: mpsc::Receiver<Arc<ServiceEvent>>,
    path: PathBuf,
    batch_delay: Duration,
    max_batch: usize,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl EventLog {
    pub fn new(
        events_rx: mpsc::Receiver<Arc<ServiceEvent>>,
        path: impl Into<PathBuf>,
        batch_delay: Duration,
        max_batch: usize,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        Self {
            events_rx,
            path: path.into(),
            batch_delay: batch_delay.max(Duration::from_millis(1)),
            max_batch: max_batch.max(1),
            metrics,
        }
    }

    /// Run until the channel closes. Returns the number of events written.
    pub async fn run(mut self) -> u64 {
        info!(path = %self.path.display(), "Event log started");

        let mut batch = Vec::with_capacity(self.max_batch);
        let mut written = 0u64;
        let mut batch_timer = interval_at(Instant::now() + self.batch_delay, self.batch_delay);

        loop {
            tokio::select! {
                received = self.events_rx.recv() => match received {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= self.max_batch {
                            written += self.flush(&mut batch, "size_limit").await;
                            batch_timer.reset();
                        }
                    }
                    None => {
                        written += self.flush(&mut batch, "shutdown").await;
                        break;
                    }
                },

                _ = batch_timer.tick() => {
                    if !batch.is_empty() {
                        written += self.flush(&mut batch, "time_delay").await;
                    }
                }
            }
        }

        info!(path = %self.path.display(), written, "Event log stopped");
        written
    }

    /// Write and clear the batch. A failed batch is dropped after logging.
    async fn flush(&self, batch: &mut Vec<Arc<ServiceEvent>>, trigger: &str) -> u64 {
        if batch.is_empty() {
            return 0;
        }
        let size = batch.len();

        let written = match self.append(batch).await {
            Ok(()) => {
                debug!(size, trigger, "Wrote event batch");
                if let Some(ref m) = self.metrics {
                    m.record_batch_written(size, trigger);
                }
                size as u64
            }
            Err(e) => {
                warn!(path = %self.path.display(), size, error = %e, "Failed to write event batch");
                if let Some(ref m) = self.metrics {
                    m.record_event_log_error();
                }
                0
            }
        };

        batch.clear();
        written
    }

    async fn append(&self, batch: &[Arc<ServiceEvent>]) -> common::Result<()> {
        let mut buffer = Vec::new();
        for event in batch {
            serde_json::to_writer(&mut buffer, event.as_ref())?;
            buffer.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buffer).await?;
        file.flush().await?;
        Ok(())
    }
}
