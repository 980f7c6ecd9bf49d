//! Logging and tracing setup
//!
//! Logs go through a non-blocking writer (stdout, or a daily rolling file
//! when `EVENTJOBS_LOG_DIR` is set). An OpenTelemetry layer is stacked on
//! top when the `telemetry` feature is built and an OTLP endpoint is set.

use anyhow::Result;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "eventjobs=info";
const LOG_FILE_PREFIX: &str = "eventjobs.log";

/// Install the global subscriber
///
/// # Environment Variables
///
/// - `EVENTJOBS_LOG_FORMAT`: `json` for structured output, anything else is pretty
/// - `EVENTJOBS_LOG_DIR`: write to a daily rolling file instead of stdout
/// - `RUST_LOG`: filter directives (default `eventjobs=info`)
///
/// The returned guard flushes buffered lines on drop; keep it alive for
/// the lifetime of the process.
pub fn init_logging() -> Result<WorkerGuard> {
    let log_format = std::env::var("EVENTJOBS_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let log_dir = std::env::var("EVENTJOBS_LOG_DIR").ok();

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;

    let (writer, guard) = match &log_dir {
        Some(dir) => tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX)),
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    let ansi = log_dir.is_none();

    let fmt_layer = match log_format.as_str() {
        // Production: JSON structured logging
        "json" => fmt::layer().json().with_writer(writer).with_ansi(false).boxed(),
        _ => fmt::layer().pretty().with_writer(writer).with_ansi(ansi).boxed(),
    };

    let otel_layer = match telemetry_layer() {
        Ok(layer) => layer,
        Err(e) => {
            eprintln!("Failed to initialize OpenTelemetry (continuing without it): {e}");
            None
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(env_filter)
        .try_init()?;

    Ok(guard)
}

/// OpenTelemetry layer if enabled
///
/// # Environment Variables
///
/// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (e.g., http://localhost:4317)
/// - `OTEL_SERVICE_NAME`: Service name (default: eventjobs)
///
/// # Example
///
/// ```text
/// OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 \
/// OTEL_SERVICE_NAME=eventjobs-dev \
///     ./eventjobs
/// ```
fn telemetry_layer<S>() -> Result<Option<Box<dyn Layer<S> + Send + Sync>>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") else {
        return Ok(None);
    };

    #[cfg(feature = "telemetry")]
    {
        otlp_layer(endpoint).map(Some)
    }

    #[cfg(not(feature = "telemetry"))]
    {
        eprintln!(
            "OTEL_EXPORTER_OTLP_ENDPOINT={endpoint} set but feature 'telemetry' not enabled; \
             rebuild with: cargo build --features telemetry"
        );
        Ok(None)
    }
}

#[cfg(feature = "telemetry")]
fn otlp_layer<S>(endpoint: String) -> Result<Box<dyn Layer<S> + Send + Sync>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::WithExportConfig;

    let service_name = std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "eventjobs".to_string());

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .build();
    let tracer = provider.tracer(service_name);
    opentelemetry::global::set_tracer_provider(provider);

    Ok(tracing_opentelemetry::layer().with_tracer(tracer).boxed())
}
