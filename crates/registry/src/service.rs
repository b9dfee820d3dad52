//! Registry service: registration, discovery and change subscriptions.

use crate::config::RegistryOptions;
use crate::event::{ServiceEvent, subscription_key};
use crate::model::{
    Audit, DEFAULT_WEIGHT, HealthStatus, InstanceFilter, SYSTEM_ACTOR, Service, ServiceGroup,
    ServiceInstance,
};
use crate::storage::{EventPublisher, Storage};
use common::{Error, Result, ResultExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Local end of one subscription
#[derive(Debug)]
struct LocalSubscriber {
    id: u64,
    cancel: CancellationToken,
    subscribed_at: SystemTime,
}

type SubscriberTable = Arc<RwLock<HashMap<String, Vec<LocalSubscriber>>>>;

/// The `(tenant, service, group)` a forwarder serves
#[derive(Debug, Clone)]
struct SubscriptionTarget {
    key: String,
    tenant_id: String,
    service_name: String,
    group_name: String,
}

/// Entry point for registration, discovery and event subscription.
///
/// Starts stopped; every operation except [`start`](Self::start),
/// [`close`](Self::close) and [`is_running`](Self::is_running) fails with
/// [`Error::NotRunning`] until started.
pub struct RegistryService {
    storage: Arc<dyn Storage>,
    publisher: Arc<dyn EventPublisher>,
    options: RegistryOptions,
    /// Liveness gate only, operations are not serialized against each other
    running: RwLock<bool>,
    /// Writers hold the lock across publisher subscribe/unsubscribe calls
    subscribers: SubscriberTable,
    next_subscriber_id: AtomicU64,
    shutdown: Mutex<CancellationToken>,
    forwarders: TaskTracker,
    dropped_events: Arc<AtomicU64>,
}

impl RegistryService {
    pub fn new(
        storage: Arc<dyn Storage>,
        publisher: Arc<dyn EventPublisher>,
        options: RegistryOptions,
    ) -> Self {
        Self {
            storage,
            publisher,
            options,
            running: RwLock::new(false),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_subscriber_id: AtomicU64::new(0),
            shutdown: Mutex::new(CancellationToken::new()),
            forwarders: TaskTracker::new(),
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start accepting operations. No-op when already running. A service
    /// stopped by [`close`](Self::close) reopens its publisher.
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }

        if let Err(e) = self.publisher.reopen().await {
            warn!(error = %e, "Failed to reopen event publisher");
        }

        if let Ok(mut token) = self.shutdown.lock() {
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }
        self.forwarders.reopen();
        *running = true;
        info!("Registry service started");
    }

    /// Stop accepting operations, close every subscriber channel and the
    /// publisher. No-op when already stopped.
    pub async fn close(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if !*running {
                return Ok(());
            }
            *running = false;
        }

        if let Ok(token) = self.shutdown.lock() {
            token.cancel();
        }

        let closed = {
            let mut subscribers = self.subscribers.write().await;
            let count: usize = subscribers.values().map(Vec::len).sum();
            subscribers.clear();
            count
        };

        if let Err(e) = self.publisher.close().await {
            warn!(error = %e, "Failed to close event publisher");
        }

        self.forwarders.close();
        if tokio::time::timeout(self.options.shutdown_grace, self.forwarders.wait())
            .await
            .is_err()
        {
            warn!(
                grace_secs = self.options.shutdown_grace.as_secs(),
                remaining = self.forwarders.len(),
                "Timed out waiting for event forwarders to stop"
            );
        }

        info!(closed_subscribers = closed, "Registry service closed");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    async fn ensure_running(&self) -> Result<()> {
        if *self.running.read().await {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    /// Register an instance, creating its service and group on first use.
    ///
    /// Returns the stored instance with defaults and the generated id filled in.
    pub async fn register(&self, mut instance: ServiceInstance) -> Result<ServiceInstance> {
        self.ensure_running().await?;
        validate_instance(&instance)?;
        apply_defaults(&mut instance);

        self.ensure_service(&instance).await?;
        self.ensure_group(&instance).await?;

        self.storage
            .save_instance(&instance)
            .await
            .context("save instance")?;

        info!(
            tenant_id = %instance.tenant_id,
            instance_id = %instance.service_instance_id,
            service_name = %instance.service_name,
            group_name = %instance.group_name,
            address = %instance.address(),
            temp_instance = instance.temp_instance,
            "Instance registered"
        );

        self.publish(ServiceEvent::register(&instance)).await;
        Ok(instance)
    }

    async fn ensure_service(&self, instance: &ServiceInstance) -> Result<()> {
        let lookup = self
            .storage
            .get_service(
                &instance.tenant_id,
                &instance.group_name,
                &instance.service_name,
            )
            .await;

        match lookup {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                let service = Service::auto_created(
                    &instance.tenant_id,
                    &instance.group_name,
                    &instance.service_name,
                );
                self.storage
                    .save_service(&service)
                    .await
                    .context("create service")?;
                info!(
                    tenant_id = %service.tenant_id,
                    service_name = %service.service_name,
                    group_name = %service.group_name,
                    "Service auto-created"
                );
                Ok(())
            }
            Err(e) => Err(e.context("look up service")),
        }
    }

    async fn ensure_group(&self, instance: &ServiceInstance) -> Result<()> {
        let lookup = self
            .storage
            .get_service_group(&instance.tenant_id, &instance.group_name)
            .await;

        match lookup {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                let group = ServiceGroup::auto_created(&instance.tenant_id, &instance.group_name);
                self.storage
                    .save_service_group(&group)
                    .await
                    .context("create service group")?;
                info!(
                    tenant_id = %group.tenant_id,
                    group_name = %group.group_name,
                    "Service group auto-created"
                );
                Ok(())
            }
            Err(e) => Err(e.context("look up service group")),
        }
    }

    pub async fn deregister(&self, tenant_id: &str, instance_id: &str) -> Result<()> {
        self.ensure_running().await?;
        require_ids(tenant_id, instance_id)?;

        let instance = self
            .storage
            .get_instance(tenant_id, instance_id)
            .await
            .context("load instance for deregistration")?;

        self.storage
            .delete_instance(tenant_id, instance_id)
            .await
            .context("delete instance")?;

        info!(
            tenant_id = %tenant_id,
            instance_id = %instance_id,
            service_name = %instance.service_name,
            "Instance deregistered"
        );

        self.publish(ServiceEvent::deregister(&instance)).await;
        Ok(())
    }

    /// Record a liveness signal from the instance.
    pub async fn heartbeat(&self, tenant_id: &str, instance_id: &str) -> Result<()> {
        self.ensure_running().await?;
        require_ids(tenant_id, instance_id)?;

        let mut instance = self
            .storage
            .get_instance(tenant_id, instance_id)
            .await
            .context("load instance for heartbeat")?;

        let now = SystemTime::now();
        self.storage
            .update_heartbeat(tenant_id, instance_id, now)
            .await
            .context("update heartbeat")?;
        instance.last_heartbeat_time = Some(now);

        debug!(tenant_id = %tenant_id, instance_id = %instance_id, "Heartbeat received");

        self.publish(ServiceEvent::heartbeat(&instance)).await;
        Ok(())
    }

    /// Instances of a service matching every filter.
    pub async fn discover(
        &self,
        tenant_id: &str,
        service_name: &str,
        group_name: &str,
        filters: &[InstanceFilter],
    ) -> Result<Vec<ServiceInstance>> {
        self.ensure_running().await?;
        require_non_empty("tenant_id", tenant_id)?;
        require_non_empty("service_name", service_name)?;
        require_non_empty("group_name", group_name)?;

        self.storage
            .get_instances(tenant_id, service_name, group_name, filters)
            .await
            .context("discover instances")
    }

    pub async fn get_instance(&self, tenant_id: &str, instance_id: &str) -> Result<ServiceInstance> {
        self.ensure_running().await?;
        require_ids(tenant_id, instance_id)?;

        self.storage
            .get_instance(tenant_id, instance_id)
            .await
            .context("get instance")
    }

    /// Names of the services in a group.
    pub async fn list_services(&self, tenant_id: &str, group_name: &str) -> Result<Vec<String>> {
        self.ensure_running().await?;
        require_non_empty("tenant_id", tenant_id)?;
        require_non_empty("group_name", group_name)?;

        self.storage
            .get_service_names(tenant_id, group_name)
            .await
            .context("list services")
    }

    /// Set the health of an instance by hand. The new status is always
    /// written; an event is published only when it differs from the old one.
    pub async fn update_health(
        &self,
        tenant_id: &str,
        instance_id: &str,
        status: HealthStatus,
    ) -> Result<()> {
        self.ensure_running().await?;
        require_ids(tenant_id, instance_id)?;

        let mut instance = self
            .storage
            .get_instance(tenant_id, instance_id)
            .await
            .context("load instance for health update")?;
        let old_status = instance.health_status;

        self.storage
            .update_instance_health(tenant_id, instance_id, status)
            .await
            .context("update instance health")?;

        if old_status != status {
            instance.health_status = status;
            info!(
                tenant_id = %tenant_id,
                instance_id = %instance_id,
                old_status = %old_status,
                new_status = %status,
                "Instance health updated"
            );
            self.publish(ServiceEvent::health_change(
                &instance,
                crate::event::SOURCE_REGISTRY,
                old_status,
            ))
            .await;
        }
        Ok(())
    }

    /// Subscribe to events of one service.
    ///
    /// The returned channel is bounded; when the caller falls behind, events
    /// are dropped rather than slowing down publishers.
    pub async fn subscribe(
        &self,
        tenant_id: &str,
        service_name: &str,
        group_name: &str,
    ) -> Result<mpsc::Receiver<Arc<ServiceEvent>>> {
        self.ensure_running().await?;
        require_non_empty("tenant_id", tenant_id)?;
        require_non_empty("service_name", service_name)?;
        require_non_empty("group_name", group_name)?;

        let target = SubscriptionTarget {
            key: subscription_key(tenant_id, service_name, group_name),
            tenant_id: tenant_id.to_string(),
            service_name: service_name.to_string(),
            group_name: group_name.to_string(),
        };
        let (sink, receiver) = mpsc::channel(self.options.subscriber_buffer.max(1));
        let cancel = match self.shutdown.lock() {
            Ok(token) => token.child_token(),
            Err(_) => return Err(Error::other("subscription state poisoned")),
        };
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut subscribers = self.subscribers.write().await;
            let source = self
                .publisher
                .subscribe(tenant_id, service_name, group_name)
                .await
                .context("subscribe to event publisher")?;

            subscribers
                .entry(target.key.clone())
                .or_default()
                .push(LocalSubscriber {
                    id,
                    cancel: cancel.clone(),
                    subscribed_at: SystemTime::now(),
                });

            let table = self.subscribers.clone();
            let publisher = self.publisher.clone();
            let dropped = self.dropped_events.clone();
            let forward_target = target.clone();
            self.forwarders.spawn(async move {
                forward_events(&forward_target.key, source, sink, cancel.clone(), dropped).await;
                // Cancelled subscribers were already removed by close or unsubscribe
                if !cancel.is_cancelled() {
                    release_subscriber(&table, publisher.as_ref(), &forward_target, id).await;
                }
            });
        }

        info!(key = %target.key, subscriber_id = id, "Subscriber added");
        Ok(receiver)
    }

    /// Close every local channel of the key and drop the publisher subscription.
    pub async fn unsubscribe(
        &self,
        tenant_id: &str,
        service_name: &str,
        group_name: &str,
    ) -> Result<()> {
        self.ensure_running().await?;

        let key = subscription_key(tenant_id, service_name, group_name);
        let removed = {
            let mut subscribers = self.subscribers.write().await;
            let removed = subscribers.remove(&key).unwrap_or_default();
            for subscriber in &removed {
                subscriber.cancel.cancel();
                debug!(
                    key = %key,
                    subscriber_id = subscriber.id,
                    age_ms = subscriber
                        .subscribed_at
                        .elapsed()
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or_default(),
                    "Subscriber closed"
                );
            }

            self.publisher
                .unsubscribe(tenant_id, service_name, group_name)
                .await
                .context("unsubscribe from event publisher")?;
            removed
        };

        info!(key = %key, closed = removed.len(), "Subscribers removed");
        Ok(())
    }

    /// Live local subscriptions across all keys.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.values().map(Vec::len).sum()
    }

    /// Events dropped because a subscriber's buffer was full.
    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Fire-and-forget publication: failures are logged, never returned.
    async fn publish(&self, event: ServiceEvent) {
        let event_type = event.event_type;
        let instance_id = event.instance_id.clone();
        if let Err(e) = self.publisher.publish(event).await {
            warn!(
                event_type = %event_type,
                instance_id = %instance_id,
                error = %e,
                "Failed to publish event"
            );
        }
    }
}

/// Copy events from the publisher into one subscriber's bounded channel.
async fn forward_events(
    key: &str,
    mut source: broadcast::Receiver<Arc<ServiceEvent>>,
    sink: mpsc::Sender<Arc<ServiceEvent>>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = sink.closed() => {
                debug!(key = %key, "Subscriber receiver dropped");
                break;
            }
            received = source.recv() => match received {
                Ok(event) => match sink.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(event)) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            key = %key,
                            event_type = %event.event_type,
                            event_id = %event.event_id,
                            "Subscriber buffer full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(key = %key, "Subscriber receiver dropped");
                        break;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    dropped.fetch_add(skipped, Ordering::Relaxed);
                    warn!(key = %key, skipped, "Forwarder lagged behind publisher");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!(key = %key, "Event forwarder stopped");
}

/// Forget a subscriber whose forwarder stopped on its own. The publisher
/// channel of the key goes away with its last local subscriber.
async fn release_subscriber(
    table: &RwLock<HashMap<String, Vec<LocalSubscriber>>>,
    publisher: &dyn EventPublisher,
    target: &SubscriptionTarget,
    id: u64,
) {
    let mut subscribers = table.write().await;
    let Some(entries) = subscribers.get_mut(&target.key) else {
        return;
    };
    let before = entries.len();
    entries.retain(|subscriber| subscriber.id != id);
    if entries.len() == before {
        return;
    }
    debug!(key = %target.key, subscriber_id = id, "Subscriber released");

    if entries.is_empty() {
        subscribers.remove(&target.key);
        if let Err(e) = publisher
            .unsubscribe(&target.tenant_id, &target.service_name, &target.group_name)
            .await
        {
            warn!(key = %target.key, error = %e, "Failed to drop publisher subscription");
        }
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(field, "must not be empty"));
    }
    Ok(())
}

fn require_ids(tenant_id: &str, instance_id: &str) -> Result<()> {
    if tenant_id.trim().is_empty() || instance_id.trim().is_empty() {
        return Err(Error::invalid_parameter(
            "tenant id and instance id are required",
        ));
    }
    Ok(())
}

fn validate_instance(instance: &ServiceInstance) -> Result<()> {
    require_non_empty("tenant_id", &instance.tenant_id)?;
    require_non_empty("service_name", &instance.service_name)?;
    require_non_empty("group_name", &instance.group_name)?;
    require_non_empty("host_address", &instance.host_address)?;
    if !(1..=65535).contains(&instance.port_number) {
        return Err(Error::validation(
            "port_number",
            format!("{} is outside 1..=65535", instance.port_number),
        ));
    }
    Ok(())
}

fn apply_defaults(instance: &mut ServiceInstance) {
    let now = SystemTime::now();

    if instance.service_instance_id.trim().is_empty() {
        instance.service_instance_id = uuid::Uuid::new_v4().to_string();
    }
    if instance.health_status == HealthStatus::Unknown {
        instance.health_status = HealthStatus::Healthy;
    }
    if instance.weight_value == 0 {
        instance.weight_value = DEFAULT_WEIGHT;
    }
    instance.heartbeat_fail_count = 0;
    instance.register_time = Some(now);
    instance.last_heartbeat_time.get_or_insert(now);
    instance.audit = Audit::new(SYSTEM_ACTOR);
}
