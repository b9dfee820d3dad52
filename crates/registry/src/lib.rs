//! Multi-tenant service registry and discovery.
//!
//! - [`RegistryService`]: registration, heartbeats, discovery and per-service
//!   change subscriptions with drop-not-block delivery.
//! - [`HealthMonitor`]: periodic active probes or passive heartbeat checks,
//!   eviction of temporary instances that keep failing.
//! - [`Storage`], [`CacheStorage`] and [`EventPublisher`]: the seams to
//!   persistence and event transport, with in-process implementations in
//!   [`MemoryStorage`] and [`BroadcastEventPublisher`].
//!
//! # Example
//!
//! ```no_run
//! use registry::{
//!     BroadcastEventPublisher, MemoryStorage, RegistryOptions, RegistryService,
//!     ServiceInstance,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> common::Result<()> {
//! let storage = Arc::new(MemoryStorage::new());
//! let publisher = Arc::new(BroadcastEventPublisher::default());
//! let registry = RegistryService::new(storage, publisher, RegistryOptions::default());
//! registry.start().await;
//!
//! let mut events = registry.subscribe("acme", "orders", "biz").await?;
//! registry
//!     .register(ServiceInstance::new("acme", "orders", "biz", "10.0.0.1", 8080))
//!     .await?;
//! let event = events.recv().await;
//! println!("{:?}", event.map(|e| e.event_type));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod event;
pub mod memory;
pub mod model;
pub mod monitor;
pub mod publisher;
pub mod service;
pub mod storage;

pub use config::{HealthMonitorConfig, RegistryOptions};
pub use event::{EventType, ServiceEvent, subscription_key};
pub use memory::MemoryStorage;
pub use model::{
    Audit, ClientType, HealthCheckMode, HealthStatus, InstanceFilter, InstanceStatus,
    LoadBalanceStrategy, ProtocolType, Service, ServiceGroup, ServiceInstance,
};
pub use monitor::{HealthMonitor, SweepSummary};
pub use publisher::{BroadcastEventPublisher, PublisherStats};
pub use service::RegistryService;
pub use storage::{CacheStorage, EventPublisher, Storage};
