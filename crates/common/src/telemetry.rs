use crate::Environment;
use crate::logging::install_subscriber;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::{MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
    trace::SdkTracerProvider,
};
use opentelemetry_semantic_conventions::attribute::{SERVICE_NAME, SERVICE_VERSION};
use std::time::Duration;

const METRIC_EXPORT_INTERVAL: Duration = Duration::from_secs(10);

/// OTLP export of capture spans and counters. Pending data is flushed when
/// the guard is dropped.
///
/// The exporters run on tonic, so `init` needs a tokio runtime context.
///
/// ```ignore
/// let _telemetry =
///     TelemetryGuard::init("capture", "http://localhost:4317", Environment::Production, "info")?;
/// ```
pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl TelemetryGuard {
    /// Installs the global tracer and meter providers, then the log
    /// subscriber with a span bridge. Replaces [`crate::setup_logging`].
    pub fn init(
        service_name: &str,
        endpoint: &str,
        environment: Environment,
        default_filter: &str,
    ) -> anyhow::Result<Self> {
        let resource = service_resource(service_name, environment);

        let tracer_provider = SdkTracerProvider::builder()
            .with_resource(resource.clone())
            .with_batch_exporter(
                SpanExporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint)
                    .build()?,
            )
            .build();
        global::set_tracer_provider(tracer_provider.clone());

        let reader = PeriodicReader::builder(
            MetricExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?,
        )
        .with_interval(METRIC_EXPORT_INTERVAL)
        .build();
        let meter_provider = SdkMeterProvider::builder()
            .with_resource(resource)
            .with_reader(reader)
            .build();
        global::set_meter_provider(meter_provider.clone());

        install_subscriber(
            environment,
            default_filter,
            Some(global::tracer(service_name.to_string())),
        );
        tracing::info!(service_name, endpoint, "Telemetry export enabled");

        Ok(Self {
            tracer_provider,
            meter_provider,
        })
    }
}

fn service_resource(service_name: &str, environment: Environment) -> Resource {
    Resource::builder()
        .with_attributes([
            KeyValue::new(SERVICE_NAME, service_name.to_string()),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            KeyValue::new("deployment.environment", environment.as_str()),
        ])
        .build()
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let traces = self.tracer_provider.shutdown();
        let metrics = self.meter_provider.shutdown();
        if let Err(e) = traces.and(metrics) {
            eprintln!("Telemetry shutdown incomplete: {:?}", e);
        }
    }
}

/// Creates an info-level span and enters it.
#[macro_export]
macro_rules! span {
    ($name:literal) => {
        tracing::info_span!($name).entered()
    };
}

/// Creates a debug-level span and enters it.
#[macro_export]
macro_rules! span_debug {
    ($name:literal) => {
        tracing::debug_span!($name).entered()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::{Key, Value};

    #[test]
    fn test_resource_identifies_service_and_environment() {
        let resource = service_resource("capture", Environment::Production);

        assert_eq!(
            resource.get(&Key::from_static_str(SERVICE_NAME)),
            Some(Value::from("capture"))
        );
        assert_eq!(
            resource.get(&Key::from_static_str("deployment.environment")),
            Some(Value::from(Environment::Production.as_str()))
        );
        assert!(resource.get(&Key::from_static_str(SERVICE_VERSION)).is_some());
    }
}
