//! Registry change events.

use crate::model::ServiceInstance;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Component that emitted an event
pub const SOURCE_REGISTRY: &str = "registry-service";
pub const SOURCE_HEALTH_MONITOR: &str = "health-monitor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Instance registered by a caller
    InstanceRegister,
    /// Instance deregistered by a caller
    InstanceDeregister,
    /// Heartbeat received from a caller
    InstanceHeartbeat,
    /// Health status flipped
    InstanceHealthChange,
    /// Heartbeat state re-evaluated by the monitor
    HeartbeatUpdated,
    /// Instance evicted by the monitor
    InstanceDeregistered,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::InstanceRegister => "INSTANCE_REGISTER",
            EventType::InstanceDeregister => "INSTANCE_DEREGISTER",
            EventType::InstanceHeartbeat => "INSTANCE_HEARTBEAT",
            EventType::InstanceHealthChange => "INSTANCE_HEALTH_CHANGE",
            EventType::HeartbeatUpdated => "HEARTBEAT_UPDATED",
            EventType::InstanceDeregistered => "INSTANCE_DEREGISTERED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription key shared by the registry and publishers: `tenant:group:service`.
pub fn subscription_key(tenant_id: &str, service_name: &str, group_name: &str) -> String {
    format!("{tenant_id}:{group_name}:{service_name}")
}

/// Immutable notification about a registry mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub tenant_id: String,
    pub service_name: String,
    pub group_name: String,
    pub instance_id: String,
    pub host_address: String,
    pub port_number: i32,
    pub source: String,
    pub timestamp: SystemTime,
    pub message: String,
    /// Snapshot of the instance at emission time, in-process only
    #[serde(skip)]
    pub instance: Option<Arc<ServiceInstance>>,
}

impl ServiceEvent {
    /// Build an event describing `instance`.
    pub fn for_instance(
        event_type: EventType,
        instance: &ServiceInstance,
        source: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            tenant_id: instance.tenant_id.clone(),
            service_name: instance.service_name.clone(),
            group_name: instance.group_name.clone(),
            instance_id: instance.service_instance_id.clone(),
            host_address: instance.host_address.clone(),
            port_number: instance.port_number,
            source: source.to_string(),
            timestamp: SystemTime::now(),
            message: message.into(),
            instance: Some(Arc::new(instance.clone())),
        }
    }

    pub fn register(instance: &ServiceInstance) -> Self {
        Self::for_instance(
            EventType::InstanceRegister,
            instance,
            SOURCE_REGISTRY,
            format!("instance {} registered", instance.address()),
        )
    }

    pub fn deregister(instance: &ServiceInstance) -> Self {
        Self::for_instance(
            EventType::InstanceDeregister,
            instance,
            SOURCE_REGISTRY,
            format!("instance {} deregistered", instance.address()),
        )
    }

    pub fn heartbeat(instance: &ServiceInstance) -> Self {
        Self::for_instance(
            EventType::InstanceHeartbeat,
            instance,
            SOURCE_REGISTRY,
            format!("heartbeat from {}", instance.address()),
        )
    }

    pub fn health_change(instance: &ServiceInstance, source: &str, old: impl fmt::Display) -> Self {
        Self::for_instance(
            EventType::InstanceHealthChange,
            instance,
            source,
            format!(
                "health changed from {} to {}",
                old, instance.health_status
            ),
        )
    }

    pub fn heartbeat_checked(instance: &ServiceInstance, message: impl Into<String>) -> Self {
        Self::for_instance(
            EventType::HeartbeatUpdated,
            instance,
            SOURCE_HEALTH_MONITOR,
            message,
        )
    }

    pub fn evicted(instance: &ServiceInstance, reason: &str) -> Self {
        Self::for_instance(
            EventType::InstanceDeregistered,
            instance,
            SOURCE_HEALTH_MONITOR,
            format!(
                "instance {} evicted after {} consecutive failures: {}",
                instance.address(),
                instance.heartbeat_fail_count,
                reason
            ),
        )
    }

    /// Subscription key this event is delivered under.
    pub fn key(&self) -> String {
        subscription_key(&self.tenant_id, &self.service_name, &self.group_name)
    }
}
