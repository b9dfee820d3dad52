//! In-process storage backing both the durable and the cache contract.

use crate::model::{
    HealthStatus, InstanceFilter, SYSTEM_ACTOR, Service, ServiceGroup, ServiceInstance,
};
use crate::storage::{CacheStorage, Storage};
use async_trait::async_trait;
use common::{Error, Result};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::time::SystemTime;
use tracing::debug;

type GroupKey = (String, String);
type ServiceKey = (String, String, String);
type InstanceKey = (String, String);

/// DashMap-backed store. One value can be handed to the registry as
/// [`Storage`] and to the health monitor as [`CacheStorage`], so both see the
/// same records.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    groups: DashMap<GroupKey, ServiceGroup>,
    services: DashMap<ServiceKey, Service>,
    instances: DashMap<InstanceKey, ServiceInstance>,
}

fn group_key(tenant_id: &str, group_name: &str) -> GroupKey {
    (tenant_id.to_string(), group_name.to_string())
}

fn service_key(tenant_id: &str, group_name: &str, service_name: &str) -> ServiceKey {
    (
        tenant_id.to_string(),
        group_name.to_string(),
        service_name.to_string(),
    )
}

fn instance_key(tenant_id: &str, instance_id: &str) -> InstanceKey {
    (tenant_id.to_string(), instance_id.to_string())
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn instances_of(
        &self,
        tenant_id: &str,
        service_name: &str,
        group_name: &str,
        filters: &[InstanceFilter],
    ) -> Vec<ServiceInstance> {
        let mut found: Vec<ServiceInstance> = self
            .instances
            .iter()
            .filter(|entry| {
                let instance = entry.value();
                instance.tenant_id == tenant_id
                    && instance.service_name == service_name
                    && instance.group_name == group_name
                    && InstanceFilter::matches_all(filters, instance)
            })
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| a.service_instance_id.cmp(&b.service_instance_id));
        found
    }

    fn update_instance<F>(&self, tenant_id: &str, instance_id: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut ServiceInstance),
    {
        match self.instances.get_mut(&instance_key(tenant_id, instance_id)) {
            Some(mut entry) => {
                update(entry.value_mut());
                Ok(())
            }
            None => Err(Error::InstanceNotFound(instance_id.to_string())),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_service(
        &self,
        tenant_id: &str,
        group_name: &str,
        service_name: &str,
    ) -> Result<Service> {
        self.services
            .get(&service_key(tenant_id, group_name, service_name))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::ServiceNotFound(format!("{group_name}/{service_name}")))
    }

    async fn save_service(&self, service: &Service) -> Result<()> {
        let key = service_key(&service.tenant_id, &service.group_name, &service.service_name);
        self.services.insert(key, service.clone());
        Ok(())
    }

    async fn get_service_group(&self, tenant_id: &str, group_name: &str) -> Result<ServiceGroup> {
        self.groups
            .get(&group_key(tenant_id, group_name))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::GroupNotFound(group_name.to_string()))
    }

    async fn save_service_group(&self, group: &ServiceGroup) -> Result<()> {
        let key = group_key(&group.tenant_id, &group.group_name);
        self.groups.insert(key, group.clone());
        Ok(())
    }

    async fn save_instance(&self, instance: &ServiceInstance) -> Result<()> {
        let key = instance_key(&instance.tenant_id, &instance.service_instance_id);
        self.instances.insert(key, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, tenant_id: &str, instance_id: &str) -> Result<ServiceInstance> {
        self.instances
            .get(&instance_key(tenant_id, instance_id))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))
    }

    async fn delete_instance(&self, tenant_id: &str, instance_id: &str) -> Result<()> {
        self.instances
            .remove(&instance_key(tenant_id, instance_id))
            .map(|_| ())
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))
    }

    async fn update_heartbeat(
        &self,
        tenant_id: &str,
        instance_id: &str,
        at: SystemTime,
    ) -> Result<()> {
        self.update_instance(tenant_id, instance_id, |instance| {
            instance.last_heartbeat_time = Some(at);
            instance.audit.touch(SYSTEM_ACTOR);
        })
    }

    async fn get_instances(
        &self,
        tenant_id: &str,
        service_name: &str,
        group_name: &str,
        filters: &[InstanceFilter],
    ) -> Result<Vec<ServiceInstance>> {
        Ok(self.instances_of(tenant_id, service_name, group_name, filters))
    }

    async fn update_instance_health(
        &self,
        tenant_id: &str,
        instance_id: &str,
        status: HealthStatus,
    ) -> Result<()> {
        self.update_instance(tenant_id, instance_id, |instance| {
            instance.health_status = status;
            instance.audit.touch(SYSTEM_ACTOR);
        })
    }

    async fn get_service_names(&self, tenant_id: &str, group_name: &str) -> Result<Vec<String>> {
        let names: BTreeSet<String> = self
            .services
            .iter()
            .filter(|entry| {
                let (tenant, group, _) = entry.key();
                tenant == tenant_id && group == group_name
            })
            .map(|entry| entry.value().service_name.clone())
            .collect();
        Ok(names.into_iter().collect())
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn list_tenant_ids(&self) -> Result<Vec<String>> {
        let tenants: BTreeSet<String> = self
            .groups
            .iter()
            .map(|entry| entry.key().0.clone())
            .chain(self.services.iter().map(|entry| entry.key().0.clone()))
            .collect();
        Ok(tenants.into_iter().collect())
    }

    async fn list_service_groups(&self, tenant_id: &str) -> Result<Vec<ServiceGroup>> {
        let mut groups: Vec<ServiceGroup> = self
            .groups
            .iter()
            .filter(|entry| entry.key().0 == tenant_id)
            .map(|entry| entry.value().clone())
            .collect();
        groups.sort_by(|a, b| a.group_name.cmp(&b.group_name));
        Ok(groups)
    }

    async fn list_services(&self, tenant_id: &str, group_name: &str) -> Result<Vec<Service>> {
        let mut services: Vec<Service> = self
            .services
            .iter()
            .filter(|entry| {
                let (tenant, group, _) = entry.key();
                tenant == tenant_id && group == group_name
            })
            .map(|entry| entry.value().clone())
            .collect();
        services.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        Ok(services)
    }

    async fn find_service(
        &self,
        tenant_id: &str,
        group_name: &str,
        service_name: &str,
    ) -> Result<Service> {
        Storage::get_service(self, tenant_id, group_name, service_name).await
    }

    async fn list_instances(
        &self,
        tenant_id: &str,
        group_name: &str,
        service_name: &str,
    ) -> Result<Vec<ServiceInstance>> {
        Ok(self.instances_of(tenant_id, service_name, group_name, &[]))
    }

    /// Merges into an existing record only. An instance deregistered while a
    /// sweep held a stale copy is not brought back, and a heartbeat received
    /// during the probe is not rolled back.
    async fn set_instance(&self, tenant_id: &str, instance: &ServiceInstance) -> Result<()> {
        self.update_instance(tenant_id, &instance.service_instance_id, |stored| {
            stored.heartbeat_fail_count = instance.heartbeat_fail_count;
            stored.health_status = instance.health_status;
            stored.last_health_check_time = instance.last_health_check_time;
            if instance.last_heartbeat_time > stored.last_heartbeat_time {
                stored.last_heartbeat_time = instance.last_heartbeat_time;
            }
            stored.audit.touch(&instance.audit.updated_by);
        })
        .inspect_err(|_| {
            debug!(
                tenant_id = %tenant_id,
                instance_id = %instance.service_instance_id,
                "Skipping cache write for removed instance"
            );
        })
    }

    async fn remove_instance(&self, tenant_id: &str, instance_id: &str) -> Result<()> {
        Storage::delete_instance(self, tenant_id, instance_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn instance(id: &str, service: &str) -> ServiceInstance {
        ServiceInstance::new("t1", service, "biz", "10.0.0.1", 8080).with_id(id)
    }

    #[tokio::test]
    async fn test_not_found_is_distinguishable() {
        let store = MemoryStorage::new();

        let err = Storage::get_service(&store, "t1", "biz", "svc").await.unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound(_)));

        let err = store.get_service_group("t1", "biz").await.unwrap_err();
        assert!(matches!(err, Error::GroupNotFound(_)));

        let err = store.get_instance("t1", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_instances_are_tenant_scoped() {
        let store = MemoryStorage::new();
        store.save_instance(&instance("i-1", "svc")).await.unwrap();

        let mut other = instance("i-1", "svc");
        other.tenant_id = "t2".to_string();
        store.save_instance(&other).await.unwrap();

        assert_eq!(store.instance_count(), 2);
        let found = store.get_instances("t1", "svc", "biz", &[]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tenant_id, "t1");
    }

    #[tokio::test]
    async fn test_updates_bump_version() {
        let store = MemoryStorage::new();
        store.save_instance(&instance("i-1", "svc")).await.unwrap();

        let at = SystemTime::now();
        store.update_heartbeat("t1", "i-1", at).await.unwrap();
        store
            .update_instance_health("t1", "i-1", HealthStatus::Unhealthy)
            .await
            .unwrap();

        let stored = store.get_instance("t1", "i-1").await.unwrap();
        assert_eq!(stored.last_heartbeat_time, Some(at));
        assert_eq!(stored.health_status, HealthStatus::Unhealthy);
        assert_eq!(stored.audit.version, 3);

        let err = store.update_heartbeat("t1", "nope", at).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cache_set_does_not_resurrect() {
        let store = MemoryStorage::new();
        let stale = instance("i-1", "svc");
        store.save_instance(&stale).await.unwrap();
        store.remove_instance("t1", "i-1").await.unwrap();

        assert!(store.set_instance("t1", &stale).await.is_err());
        assert_eq!(store.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_cache_set_keeps_newer_heartbeat() {
        let store = MemoryStorage::new();
        let mut snapshot = instance("i-1", "svc");
        snapshot.last_heartbeat_time = Some(SystemTime::now() - Duration::from_secs(20));
        store.save_instance(&snapshot).await.unwrap();

        let fresh = SystemTime::now();
        store.update_heartbeat("t1", "i-1", fresh).await.unwrap();

        snapshot.heartbeat_fail_count = 2;
        snapshot.health_status = HealthStatus::Unhealthy;
        snapshot.last_health_check_time = Some(fresh);
        snapshot.weight_value = 1;
        snapshot.audit.touch("health-monitor");
        store.set_instance("t1", &snapshot).await.unwrap();

        let stored = store.get_instance("t1", "i-1").await.unwrap();
        assert_eq!(stored.last_heartbeat_time, Some(fresh));
        assert_eq!(stored.heartbeat_fail_count, 2);
        assert_eq!(stored.health_status, HealthStatus::Unhealthy);
        assert_eq!(stored.last_health_check_time, Some(fresh));
        assert_ne!(stored.weight_value, 1);
        assert_eq!(stored.audit.updated_by, "health-monitor");
        assert_eq!(stored.audit.version, 3);
    }

    #[tokio::test]
    async fn test_listing_services_and_tenants() {
        let store = MemoryStorage::new();
        store
            .save_service_group(&ServiceGroup::auto_created("t1", "biz"))
            .await
            .unwrap();
        store
            .save_service(&Service::auto_created("t1", "biz", "orders"))
            .await
            .unwrap();
        store
            .save_service(&Service::auto_created("t1", "biz", "billing"))
            .await
            .unwrap();
        store
            .save_service(&Service::auto_created("t2", "ops", "audit"))
            .await
            .unwrap();

        assert_eq!(store.list_tenant_ids().await.unwrap(), vec!["t1", "t2"]);
        assert_eq!(
            store.get_service_names("t1", "biz").await.unwrap(),
            vec!["billing", "orders"]
        );
        let services = store.list_services("t1", "biz").await.unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(store.list_service_groups("t2").await.unwrap().len(), 0);
        assert!(store.find_service("t2", "ops", "audit").await.is_ok());
    }
}
