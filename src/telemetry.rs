use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{TonicExporterBuilder, WithExportConfig};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Config, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

const DEFAULT_LOG_LEVEL: &str = "INFO";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(15);

/// Installs the global subscriber. `RUST_LOG` overrides the level. Without an
/// OTLP endpoint everything goes to the console; with one, console output is
/// only kept when `console` is set.
pub(crate) fn init_telemetry(endpoint: Option<&str>, console: bool) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    let registry = Registry::default().with(filter);

    match endpoint {
        None => registry.with(fmt::layer()).try_init()?,
        Some(endpoint) => {
            let (tracer, meter) = install_otlp(endpoint)?;
            registry
                .with(OpenTelemetryLayer::new(tracer))
                .with(MetricsLayer::new(meter))
                .with(console.then(fmt::layer))
                .try_init()?
        }
    }
    Ok(())
}

fn service_resource() -> Resource {
    Resource::new(vec![
        KeyValue::new(SERVICE_NAME, env!("CARGO_PKG_NAME")),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ])
}

/// Starts the batch span and metric exporters towards `endpoint`.
fn install_otlp(endpoint: &str) -> Result<(Tracer, SdkMeterProvider)> {
    let resource = service_resource();

    let tracer_provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(otlp_exporter(endpoint))
        .with_trace_config(Config::default().with_resource(resource.clone()))
        .install_batch(runtime::Tokio)
        .with_context(|| format!("Failed to export traces to {endpoint}"))?;
    let tracer = tracer_provider.tracer(env!("CARGO_PKG_NAME"));
    global::set_tracer_provider(tracer_provider);

    let meter = opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(otlp_exporter(endpoint))
        .with_resource(resource)
        .build()
        .with_context(|| format!("Failed to export metrics to {endpoint}"))?;

    global::set_text_map_propagator(TraceContextPropagator::new());
    Ok((tracer, meter))
}

fn otlp_exporter(endpoint: &str) -> TonicExporterBuilder {
    opentelemetry_otlp::new_exporter()
        .tonic()
        .with_timeout(EXPORT_TIMEOUT)
        .with_endpoint(endpoint)
}

#[cfg(test)]
mod tests {
    use opentelemetry::{Key, Value};

    use super::*;

    #[test]
    fn exported_telemetry_names_the_service() {
        let resource = service_resource();
        assert_eq!(
            resource.get(Key::from_static_str(SERVICE_NAME)),
            Some(Value::from("symptom_normalizer"))
        );
        assert!(resource.get(Key::from_static_str(SERVICE_VERSION)).is_some());
    }
}
