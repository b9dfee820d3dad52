//! Registry domain model: groups, services, instances.

use healthcheck::{CheckType, DEFAULT_HEALTH_PATH};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

/// Actor recorded in audit fields for writes made by the registry itself.
pub const SYSTEM_ACTOR: &str = "system";

/// Default health-check interval for auto-created services and groups.
pub const DEFAULT_CHECK_INTERVAL_SECS: u32 = 30;

/// Default probe timeout for auto-created services.
pub const DEFAULT_CHECK_TIMEOUT_SECS: u32 = 5;

/// Default weight of a registered instance.
pub const DEFAULT_WEIGHT: u32 = 100;

/// Lifecycle status reported by the instance itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    #[default]
    Up,
    Down,
    Starting,
    OutOfService,
}

/// Health as judged by checks and heartbeats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
            HealthStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Kind of client that registered an instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClientType {
    #[default]
    Service,
    Gateway,
    Sdk,
}

/// Whether the monitor probes instances or only watches heartbeats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthCheckMode {
    #[default]
    Active,
    Passive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProtocolType {
    #[default]
    Http,
    Https,
    Tcp,
    Grpc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    Random,
    LeastConnections,
    ConsistentHash,
}

/// Audit columns carried by every persisted record.
///
/// The core sets these on create and bumps them on update; it never reads them
/// back for decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audit {
    pub created_at: SystemTime,
    pub created_by: String,
    pub updated_at: SystemTime,
    pub updated_by: String,
    /// Optimistic-concurrency version, starts at 1
    pub version: u64,
    /// Soft-delete flag
    pub active: bool,
}

impl Audit {
    pub fn new(actor: impl Into<String>) -> Self {
        let actor = actor.into();
        let now = SystemTime::now();
        Self {
            created_at: now,
            created_by: actor.clone(),
            updated_at: now,
            updated_by: actor,
            version: 1,
            active: true,
        }
    }

    /// Record an update by `actor`.
    pub fn touch(&mut self, actor: &str) {
        self.updated_at = SystemTime::now();
        self.updated_by = actor.to_string();
        self.version += 1;
    }
}

impl Default for Audit {
    fn default() -> Self {
        Self::new(SYSTEM_ACTOR)
    }
}

/// Tenant-scoped namespace for services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub group_id: String,
    pub tenant_id: String,
    pub group_name: String,
    pub description: String,
    pub group_type: String,
    pub owner: String,
    pub access_control_enabled: bool,
    pub default_protocol_type: ProtocolType,
    pub default_load_balance_strategy: LoadBalanceStrategy,
    pub default_health_check_url: String,
    pub default_health_check_interval_seconds: u32,
    pub audit: Audit,
}

impl ServiceGroup {
    /// Group created implicitly by the first registration into it.
    pub fn auto_created(tenant_id: &str, group_name: &str) -> Self {
        Self {
            group_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            group_name: group_name.to_string(),
            description: format!("Auto-created group for {group_name}"),
            group_type: "BUSINESS".to_string(),
            owner: SYSTEM_ACTOR.to_string(),
            access_control_enabled: false,
            default_protocol_type: ProtocolType::Http,
            default_load_balance_strategy: LoadBalanceStrategy::RoundRobin,
            default_health_check_url: DEFAULT_HEALTH_PATH.to_string(),
            default_health_check_interval_seconds: DEFAULT_CHECK_INTERVAL_SECS,
            audit: Audit::new(SYSTEM_ACTOR),
        }
    }
}

/// Named, discoverable unit within a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub tenant_id: String,
    pub group_name: String,
    pub service_name: String,
    pub description: String,
    pub protocol_type: ProtocolType,
    pub load_balance_strategy: LoadBalanceStrategy,
    pub health_check_url: String,
    pub health_check_type: CheckType,
    pub health_check_mode: HealthCheckMode,
    /// Zero falls back to the monitor default
    pub health_check_interval_seconds: u32,
    /// Zero falls back to the monitor default
    pub health_check_timeout_seconds: u32,
    pub metadata: Option<serde_json::Value>,
    pub audit: Audit,
}

impl Service {
    /// Service created implicitly by the first registration into it.
    pub fn auto_created(tenant_id: &str, group_name: &str, service_name: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            group_name: group_name.to_string(),
            service_name: service_name.to_string(),
            description: format!("Auto-created service for {service_name}"),
            protocol_type: ProtocolType::Http,
            load_balance_strategy: LoadBalanceStrategy::RoundRobin,
            health_check_url: DEFAULT_HEALTH_PATH.to_string(),
            health_check_type: CheckType::Http,
            health_check_mode: HealthCheckMode::Active,
            health_check_interval_seconds: DEFAULT_CHECK_INTERVAL_SECS,
            health_check_timeout_seconds: DEFAULT_CHECK_TIMEOUT_SECS,
            metadata: None,
            audit: Audit::new(SYSTEM_ACTOR),
        }
    }

    /// Configured check interval, or `fallback` when unset.
    pub fn check_interval(&self, fallback: Duration) -> Duration {
        match self.health_check_interval_seconds {
            0 => fallback,
            secs => Duration::from_secs(u64::from(secs)),
        }
    }

    /// Configured probe timeout, or `fallback` when unset.
    pub fn check_timeout(&self, fallback: Duration) -> Duration {
        match self.health_check_timeout_seconds {
            0 => fallback,
            secs => Duration::from_secs(u64::from(secs)),
        }
    }
}

/// One network endpoint implementing a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub tenant_id: String,
    pub service_instance_id: String,
    pub service_name: String,
    pub group_name: String,
    pub host_address: String,
    /// Kept signed so out-of-range input can be reported instead of truncated
    pub port_number: i32,
    pub context_path: String,
    pub instance_status: InstanceStatus,
    pub health_status: HealthStatus,
    /// Zero is replaced with the default on registration
    pub weight_value: u32,
    pub client_type: ClientType,
    pub metadata: Option<serde_json::Value>,
    pub tags: Option<serde_json::Value>,
    /// Ephemeral instances are evicted by the health monitor
    pub temp_instance: bool,
    /// Consecutive failed checks, reset on success
    pub heartbeat_fail_count: u32,
    pub last_heartbeat_time: Option<SystemTime>,
    pub last_health_check_time: Option<SystemTime>,
    pub register_time: Option<SystemTime>,
    pub audit: Audit,
}

impl ServiceInstance {
    /// Instance with only the identifying fields set; the rest take
    /// registration defaults.
    pub fn new(
        tenant_id: impl Into<String>,
        service_name: impl Into<String>,
        group_name: impl Into<String>,
        host_address: impl Into<String>,
        port_number: i32,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            service_instance_id: String::new(),
            service_name: service_name.into(),
            group_name: group_name.into(),
            host_address: host_address.into(),
            port_number,
            context_path: String::new(),
            instance_status: InstanceStatus::Up,
            health_status: HealthStatus::Unknown,
            weight_value: 0,
            client_type: ClientType::Service,
            metadata: None,
            tags: None,
            temp_instance: false,
            heartbeat_fail_count: 0,
            last_heartbeat_time: None,
            last_health_check_time: None,
            register_time: None,
            audit: Audit::default(),
        }
    }

    pub fn ephemeral(mut self) -> Self {
        self.temp_instance = true;
        self
    }

    pub fn with_id(mut self, instance_id: impl Into<String>) -> Self {
        self.service_instance_id = instance_id.into();
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host_address, self.port_number)
    }

    /// Time since the last heartbeat, falling back to the registration time.
    pub fn heartbeat_age(&self, now: SystemTime) -> Option<Duration> {
        self.last_heartbeat_time
            .or(self.register_time)
            .and_then(|at| now.duration_since(at).ok())
    }

    /// Time since the last active probe, `None` if never probed.
    pub fn check_age(&self, now: SystemTime) -> Option<Duration> {
        self.last_health_check_time
            .and_then(|at| now.duration_since(at).ok())
    }
}

/// Discover predicate. Filters passed together are combined with AND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceFilter {
    Status(InstanceStatus),
    Health(HealthStatus),
    Ephemeral(bool),
    Host(String),
}

impl InstanceFilter {
    pub fn matches(&self, instance: &ServiceInstance) -> bool {
        match self {
            InstanceFilter::Status(status) => instance.instance_status == *status,
            InstanceFilter::Health(health) => instance.health_status == *health,
            InstanceFilter::Ephemeral(temp) => instance.temp_instance == *temp,
            InstanceFilter::Host(host) => instance.host_address == *host,
        }
    }

    pub fn matches_all(filters: &[InstanceFilter], instance: &ServiceInstance) -> bool {
        filters.iter().all(|f| f.matches(instance))
    }
}
