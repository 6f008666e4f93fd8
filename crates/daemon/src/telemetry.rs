//! OpenTelemetry export of tracing spans
//!
//! # Environment Variables
//!
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (e.g., http://localhost:4317)
//! - `OTEL_SERVICE_NAME`: Service name (default: scanfleet)
//!
//! ```text
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 \
//! OTEL_SERVICE_NAME=scanfleet-dev \
//!     ./scanfleetd
//! ```

use anyhow::Result;

const ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
#[cfg(feature = "telemetry")]
const SERVICE_NAME_ENV: &str = "OTEL_SERVICE_NAME";
#[cfg(feature = "telemetry")]
const DEFAULT_SERVICE_NAME: &str = "scanfleet";

/// OTLP layer to stack on the subscriber; `None` when no endpoint is configured
#[cfg(feature = "telemetry")]
pub fn otlp_layer<S>(
) -> Result<Option<tracing_opentelemetry::OpenTelemetryLayer<S, opentelemetry_sdk::trace::Tracer>>>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::Resource;

    let Ok(endpoint) = std::env::var(ENDPOINT_ENV) else {
        return Ok(None);
    };
    let service_name =
        std::env::var(SERVICE_NAME_ENV).unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string());

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            service_name.clone(),
        )]))
        .build();
    let tracer = provider.tracer(service_name);
    opentelemetry::global::set_tracer_provider(provider);

    Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
}

#[cfg(not(feature = "telemetry"))]
pub fn otlp_layer() -> Result<Option<tracing_subscriber::layer::Identity>> {
    Ok(None)
}

/// Log once the subscriber is up, so the outcome is visible
pub fn report() {
    let Ok(endpoint) = std::env::var(ENDPOINT_ENV) else {
        tracing::debug!("OpenTelemetry not configured ({} not set)", ENDPOINT_ENV);
        return;
    };

    if cfg!(feature = "telemetry") {
        tracing::info!(endpoint = %endpoint, "OpenTelemetry export enabled");
    } else {
        tracing::warn!(
            endpoint = %endpoint,
            "OpenTelemetry endpoint set but feature 'telemetry' not enabled"
        );
    }
}

/// Flush pending spans
pub fn shutdown() {
    #[cfg(feature = "telemetry")]
    opentelemetry::global::shutdown_tracer_provider();
}
