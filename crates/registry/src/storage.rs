//! Capabilities the registry core consumes from its collaborators.
//!
//! Implementations must be safe for concurrent use; the core shares them
//! across tasks behind `Arc<dyn ..>` without any additional locking.

use crate::event::ServiceEvent;
use crate::model::{HealthStatus, InstanceFilter, Service, ServiceGroup, ServiceInstance};
use async_trait::async_trait;
use common::Result;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast;

/// Durable storage.
///
/// Lookups report a missing record with one of the `*NotFound` errors so the
/// caller can tell "absent" apart from a backend failure.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_service(
        &self,
        tenant_id: &str,
        group_name: &str,
        service_name: &str,
    ) -> Result<Service>;

    async fn save_service(&self, service: &Service) -> Result<()>;

    async fn get_service_group(&self, tenant_id: &str, group_name: &str) -> Result<ServiceGroup>;

    async fn save_service_group(&self, group: &ServiceGroup) -> Result<()>;

    async fn save_instance(&self, instance: &ServiceInstance) -> Result<()>;

    async fn get_instance(&self, tenant_id: &str, instance_id: &str) -> Result<ServiceInstance>;

    async fn delete_instance(&self, tenant_id: &str, instance_id: &str) -> Result<()>;

    async fn update_heartbeat(
        &self,
        tenant_id: &str,
        instance_id: &str,
        at: SystemTime,
    ) -> Result<()>;

    async fn get_instances(
        &self,
        tenant_id: &str,
        service_name: &str,
        group_name: &str,
        filters: &[InstanceFilter],
    ) -> Result<Vec<ServiceInstance>>;

    async fn update_instance_health(
        &self,
        tenant_id: &str,
        instance_id: &str,
        status: HealthStatus,
    ) -> Result<()>;

    async fn get_service_names(&self, tenant_id: &str, group_name: &str) -> Result<Vec<String>>;
}

/// Low-latency read path used by the health monitor.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn list_tenant_ids(&self) -> Result<Vec<String>>;

    async fn list_service_groups(&self, tenant_id: &str) -> Result<Vec<ServiceGroup>>;

    async fn list_services(&self, tenant_id: &str, group_name: &str) -> Result<Vec<Service>>;

    async fn find_service(
        &self,
        tenant_id: &str,
        group_name: &str,
        service_name: &str,
    ) -> Result<Service>;

    async fn list_instances(
        &self,
        tenant_id: &str,
        group_name: &str,
        service_name: &str,
    ) -> Result<Vec<ServiceInstance>>;

    /// Write back the health state the monitor owns: fail count, health
    /// status, last check time and audit. The heartbeat time is taken only
    /// when newer than the stored one, every other field keeps its stored value.
    async fn set_instance(&self, tenant_id: &str, instance: &ServiceInstance) -> Result<()>;

    async fn remove_instance(&self, tenant_id: &str, instance_id: &str) -> Result<()>;
}

/// Event bus the registry publishes mutations to.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: ServiceEvent) -> Result<()>;

    /// Receiver for every event published under `(tenant, service, group)`.
    /// The receiver reports `Closed` once the subscription is dropped.
    async fn subscribe(
        &self,
        tenant_id: &str,
        service_name: &str,
        group_name: &str,
    ) -> Result<broadcast::Receiver<Arc<ServiceEvent>>>;

    async fn unsubscribe(&self, tenant_id: &str, service_name: &str, group_name: &str)
    -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Accept publications and subscriptions again after `close`.
    /// No-op on an open publisher.
    async fn reopen(&self) -> Result<()>;
}
