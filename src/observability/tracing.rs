use anyhow::{Context, Error, Result};
use once_cell::sync::OnceCell;
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, Sampler, SdkTracer, SdkTracerProvider},
};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use super::structured_log::StructuredLogLayer;

const SERVICE_NAME: &str = "selflearn-worker";

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Where spans go, if anywhere beyond the log output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TracingSettings {
    pub otlp_endpoint: Option<String>,
    pub sampling_ratio: f64,
}

impl From<&crate::config::Config> for TracingSettings {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            otlp_endpoint: config.otel_exporter_endpoint().map(str::to_string),
            sampling_ratio: config.otel_sampling_ratio(),
        }
    }
}

/// Installs the global subscriber once per process.
///
/// With an OTLP endpoint, spans are exported through OpenTelemetry; otherwise
/// (or when the exporter cannot be built) the structured JSON log layer is
/// used. Later calls are no-ops.
///
/// # Errors
/// Fails when a different global subscriber is already installed.
pub fn init(settings: &TracingSettings) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).json();

        let tracer = settings
            .otlp_endpoint
            .as_deref()
            .map(|endpoint| (endpoint, init_tracer(endpoint, settings.sampling_ratio)));

        match tracer {
            Some((endpoint, Ok(tracer))) => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .try_init()
                    .map_err(|e| Error::msg(e.to_string()))?;
                info!(otel_enabled = true, endpoint = %endpoint, "tracing initialized with OpenTelemetry");
            }
            Some((_, Err(error))) => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(StructuredLogLayer)
                    .try_init()
                    .map_err(|e| Error::msg(e.to_string()))?;
                info!(otel_enabled = false, error = %error, "tracing initialized without OpenTelemetry (init failed)");
            }
            None => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(StructuredLogLayer)
                    .try_init()
                    .map_err(|e| Error::msg(e.to_string()))?;
                info!(otel_enabled = false, "standard tracing initialized");
            }
        }

        Ok::<(), Error>(())
    })?;
    Ok(())
}

fn init_tracer(endpoint: &str, sampling_ratio: f64) -> Result<SdkTracer> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("failed to build OTLP span exporter")?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(sampling_ratio))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = tracer_provider.tracer(SERVICE_NAME);
    global::set_tracer_provider(tracer_provider);

    Ok(tracer)
}
