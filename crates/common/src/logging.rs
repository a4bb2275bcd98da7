use crate::config::Environment;
use opentelemetry::global::BoxedTracer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber: pretty output for development,
/// JSON for production.
///
/// `RUST_LOG` takes precedence; `default_filter` applies when it is unset
/// or invalid (e.g. `"info"` or `"capture=debug,pool=info"`).
///
/// Spans stay local. Use [`crate::TelemetryGuard`] instead to export them.
pub fn setup_logging(environment: Environment, default_filter: &str) {
    install_subscriber(environment, default_filter, None);
}

/// Installs the global subscriber, bridging spans to `tracer` when given.
pub(crate) fn install_subscriber(
    environment: Environment,
    default_filter: &str,
    tracer: Option<BoxedTracer>,
) {
    let otel_layer = tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    let registry = tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(otel_layer);

    match environment {
        Environment::Production => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_level(true))
                .init();
        }
        Environment::Development => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty().with_ansi(true))
                .init();
        }
    }
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}
