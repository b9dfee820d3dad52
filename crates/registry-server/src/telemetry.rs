//! Tracing bootstrap with optional OpenTelemetry export
//!
//! Without telemetry the server logs through `common::logging`. With it, the
//! same filter and fmt layer are combined with an OTLP span exporter.

use crate::config::{LoggingSettings, TelemetrySettings};
use common::logging::{LogFormat, env_filter};
use opentelemetry::{KeyValue, trace::TracerProvider as _};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// OpenTelemetry tracer guard
///
/// When dropped, flushes all pending spans and shuts down the tracer
pub struct TelemetryGuard;

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

/// Build the OTLP tracer provider. Returns `None` when telemetry is disabled.
pub fn init_telemetry(
    settings: &TelemetrySettings,
) -> Result<Option<TracerProvider>, Box<dyn std::error::Error>> {
    if !settings.enabled {
        return Ok(None);
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(settings.otlp_endpoint.as_str())
        .build()?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", settings.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
    ]);

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(Some(provider))
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process.
pub fn setup_tracing(
    telemetry: &TelemetrySettings,
    logging: &LoggingSettings,
) -> Result<Option<TelemetryGuard>, Box<dyn std::error::Error>> {
    let level = logging.level.as_deref().unwrap_or("info");

    let Some(provider) = init_telemetry(telemetry)? else {
        common::logging::init(level, logging.format);
        tracing::info!("Tracing initialized without OpenTelemetry");
        return Ok(None);
    };

    let tracer = provider.tracer(telemetry.service_name.clone());
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
    let registry = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(otel_layer);
    match logging.format {
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }

    tracing::info!(
        service_name = %telemetry.service_name,
        otlp_endpoint = %telemetry.otlp_endpoint,
        "Tracing initialized with OpenTelemetry integration"
    );
    Ok(Some(TelemetryGuard))
}
