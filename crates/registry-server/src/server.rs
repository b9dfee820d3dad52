//! Main registry server implementation.

use crate::config::Config;
use crate::event_log::EventLog;
use crate::http_server::{AppState, MetricsServer};
use crate::metrics::MetricsRegistry;
use crate::recording::RecordingPublisher;
use common::Result;
use registry::{
    BroadcastEventPublisher, EventPublisher, HealthMonitor, MemoryStorage, RegistryService,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registry server
pub struct RegistryServer {
    config: Config,
}

impl RegistryServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until Ctrl-C
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            }
        })
        .await
    }

    /// Run until `shutdown` completes, then stop every component in order:
    /// monitor, registry (closing subscribers and the publisher), event log,
    /// HTTP endpoint.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("Starting registry server");
        let config = &self.config;

        let storage = Arc::new(MemoryStorage::new());
        let broadcast = Arc::new(BroadcastEventPublisher::new(
            config.registry.publisher_capacity,
        ));

        let metrics = if config.metrics.enabled {
            info!("Metrics enabled on {}", config.metrics.listen_addr);
            Some(Arc::new(MetricsRegistry::new()))
        } else {
            info!("Metrics disabled");
            None
        };

        let (event_log_tx, event_log_handle) = if config.event_log.enabled {
            let (tx, rx) = mpsc::channel(config.event_log.channel_size);
            let event_log = EventLog::new(
                rx,
                &config.event_log.path,
                config.event_log.batch_delay,
                config.event_log.max_batch,
                metrics.clone(),
            );
            (Some(tx), Some(tokio::spawn(event_log.run())))
        } else {
            (None, None)
        };

        let publisher: Arc<dyn EventPublisher> = Arc::new(RecordingPublisher::new(
            broadcast,
            metrics.clone(),
            event_log_tx,
        ));

        let registry = Arc::new(RegistryService::new(
            storage.clone(),
            publisher.clone(),
            config.to_registry_options(),
        ));
        registry.start().await;
        self.register_bootstrap(&registry).await;

        let monitor = Arc::new(HealthMonitor::with_default_checkers(
            storage,
            publisher,
            config.to_monitor_config(),
        )?);
        monitor.start().await?;

        let cancel = CancellationToken::new();
        let mut background: Vec<JoinHandle<()>> = Vec::new();

        if let Some(ref metrics) = metrics {
            let state = Arc::new(AppState {
                metrics: metrics.clone(),
                monitor: monitor.clone(),
                registry: registry.clone(),
            });
            let server = MetricsServer::new(state, config.metrics.listen_addr.clone());
            let server_cancel = cancel.clone();
            background.push(tokio::spawn(async move {
                if let Err(e) = server.run(server_cancel).await {
                    warn!(error = %e, "Metrics server error");
                }
            }));

            background.push(tokio::spawn(report_stats(
                metrics.clone(),
                monitor.clone(),
                registry.clone(),
                config.metrics.stats_interval,
                cancel.clone(),
            )));
        }

        info!("All tasks spawned, server running");
        shutdown.await;

        if let Err(e) = monitor.stop().await {
            warn!(error = %e, "Failed to stop health monitor");
        }
        if let Err(e) = registry.close().await {
            warn!(error = %e, "Failed to close registry");
        }

        if let Some(handle) = event_log_handle {
            match tokio::time::timeout(config.registry.shutdown_grace, handle).await {
                Ok(Ok(written)) => info!(written, "Event log drained"),
                Ok(Err(e)) => warn!(error = %e, "Event log task failed"),
                Err(_) => warn!("Timed out waiting for event log to drain"),
            }
        }

        cancel.cancel();
        for handle in background {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task failed");
            }
        }

        info!("Registry server stopped");
        Ok(())
    }

    async fn register_bootstrap(&self, registry: &RegistryService) {
        for entry in &self.config.bootstrap.instances {
            match registry.register(entry.to_instance()).await {
                Ok(instance) => info!(
                    tenant_id = %instance.tenant_id,
                    instance_id = %instance.service_instance_id,
                    service_name = %instance.service_name,
                    "Bootstrap instance registered"
                ),
                Err(e) => warn!(
                    tenant_id = %entry.tenant_id,
                    service_name = %entry.service_name,
                    error = %e,
                    "Failed to register bootstrap instance"
                ),
            }
        }
    }
}

/// Mirror monitor and subscription counters into the metrics registry
async fn report_stats(
    metrics: Arc<MetricsRegistry>,
    monitor: Arc<HealthMonitor>,
    registry: Arc<RegistryService>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stats = monitor.get_stats();
                metrics.update_monitor_stats(&stats);
                if let Some(sweep) = monitor.last_sweep() {
                    metrics.update_sweep(&sweep);
                }
                metrics.update_subscribers(
                    registry.subscriber_count().await,
                    registry.dropped_event_count(),
                );
                debug!(
                    total_checks = stats.total_checks,
                    success_rate = stats.success_rate(),
                    active_instances = stats.active_instances,
                    "Stats refreshed"
                );
            }
        }
    }
}
