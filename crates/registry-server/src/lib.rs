//! Standalone registry server
//!
//! Hosts the registry core in one process: an in-memory store, the
//! registry service, the health monitor and the components around them.
//!
//! # Components
//!
//! - **RecordingPublisher**: wraps the event publisher, feeds metrics and the event log
//! - **EventLog**: batches events and appends them as JSON lines
//! - **MetricsServer**: `/metrics`, `/stats` and `/healthz` over HTTP
//! - **RegistryServer**: wires everything together and shuts it down in order

pub mod config;
pub mod event_log;
pub mod http_server;
pub mod metrics;
pub mod recording;
pub mod server;
pub mod telemetry;

pub use config::{Config, ConfigError};
pub use event_log::EventLog;
pub use http_server::{AppState, MetricsServer};
pub use metrics::MetricsRegistry;
pub use recording::RecordingPublisher;
pub use server::RegistryServer;
pub use telemetry::{TelemetryGuard, setup_tracing};
