//! In-process event publisher built on tokio broadcast channels.

use crate::event::{ServiceEvent, subscription_key};
use crate::storage::EventPublisher;
use async_trait::async_trait;
use common::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Default broadcast capacity per subscription key
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Publisher statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Subscription keys with a live channel
    pub active_keys: usize,
    /// Events accepted by `publish`
    pub events_published: u64,
    /// Sum of receivers reached across all published events
    pub events_delivered: u64,
}

/// One broadcast sender per `tenant:group:service` key.
#[derive(Debug)]
pub struct BroadcastEventPublisher {
    channels: DashMap<String, broadcast::Sender<Arc<ServiceEvent>>>,
    stats: Mutex<PublisherStats>,
    capacity: usize,
    closed: AtomicBool,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            stats: Mutex::new(PublisherStats::default()),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn get_stats(&self) -> PublisherStats {
        let base = self
            .stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default();
        PublisherStats {
            active_keys: self.channels.len(),
            ..base
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::event("event publisher is closed"));
        }
        Ok(())
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: ServiceEvent) -> Result<()> {
        self.ensure_open()?;

        let key = event.key();
        let event_type = event.event_type;
        let event_id = event.event_id.clone();

        // Clone the sender out so the map shard is not held across send
        let sender = self.channels.get(&key).map(|entry| entry.value().clone());
        let delivered = match sender {
            Some(sender) => sender.send(Arc::new(event)).unwrap_or(0),
            None => 0,
        };

        if let Ok(mut stats) = self.stats.lock() {
            stats.events_published += 1;
            stats.events_delivered += delivered as u64;
        }

        debug!(
            key = %key,
            event_type = %event_type,
            event_id = %event_id,
            subscriber_count = delivered,
            "Published event"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        tenant_id: &str,
        service_name: &str,
        group_name: &str,
    ) -> Result<broadcast::Receiver<Arc<ServiceEvent>>> {
        self.ensure_open()?;

        let key = subscription_key(tenant_id, service_name, group_name);
        let receiver = self
            .channels
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(key = %key, capacity = self.capacity, "Created broadcast channel");
                broadcast::channel(self.capacity).0
            })
            .subscribe();

        info!(key = %key, "New publisher subscription");
        Ok(receiver)
    }

    async fn unsubscribe(
        &self,
        tenant_id: &str,
        service_name: &str,
        group_name: &str,
    ) -> Result<()> {
        let key = subscription_key(tenant_id, service_name, group_name);
        // Dropping the sender closes every receiver of the key
        if self.channels.remove(&key).is_some() {
            info!(key = %key, "Removed publisher subscription");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let count = self.channels.len();
        self.channels.clear();
        info!(closed_channels = count, "Event publisher closed");
        Ok(())
    }

    async fn reopen(&self) -> Result<()> {
        if self.closed.swap(false, Ordering::AcqRel) {
            info!("Event publisher reopened");
        }
        Ok(())
    }
}
