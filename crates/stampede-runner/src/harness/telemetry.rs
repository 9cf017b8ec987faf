//! Console logs, and OpenTelemetry export of bursts, polls and verdicts.
//!
//! Console logging is always on and filtered with `RUST_LOG`. Export is
//! opt-in:
//!
//! - `tracing`: spans, plus the `tracing` events of the core and client
//!   crates.
//! - `metrics`: per-burst outcome and failure-code counters, burst duration,
//!   poll attempts per signal, verdicts per scenario and status.
//! - `otlp`: OTLP/HTTP to `OTLP_ENDPOINT`, with optional `OTLP_HEADERS`
//!   (`key=value,key=value`).
//! - `stdout`: both signals printed on the console.
//!
//! The exporters need `tracing` or `metrics` to have anything to send.
//!
//! ```bash
//! OTLP_ENDPOINT=http://127.0.0.1:4318 \
//!   cargo run -p stampede-runner --features tracing,metrics,otlp -- --scenario all
//! ```

#[cfg(all(feature = "otlp", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!("The 'otlp' feature requires at least one of 'tracing' or 'metrics' to be enabled.");

#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use stampede::{Convergence, RunReport, VerdictSet};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semconv;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics::SdkMeterProvider;
#[cfg(feature = "metrics")]
use stampede::VerdictStatus;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace::SdkTracerProvider;

#[cfg(feature = "otlp")]
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};

const SERVICE_NAME: &str = "stampede";

/// Exporter pipelines installed for the run. Dropping them without
/// [`shutdown`](Self::shutdown) loses whatever is still buffered.
pub struct Telemetry {
    #[cfg(feature = "tracing")]
    tracer_provider: SdkTracerProvider,
    #[cfg(feature = "metrics")]
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    /// Flushes and stops the exporters. Errors go to stderr since the
    /// subscriber may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "tracing")]
        {
            for result in [
                self.tracer_provider.force_flush(),
                self.tracer_provider.shutdown(),
            ] {
                if let Err(err) = result {
                    eprintln!("Span export did not shut down cleanly: {err:#?}");
                }
            }
        }

        #[cfg(feature = "metrics")]
        {
            for result in [
                self.meter_provider.force_flush(),
                self.meter_provider.shutdown(),
            ] {
                if let Err(err) = result {
                    eprintln!("Metric export did not shut down cleanly: {err:#?}");
                }
            }
        }
    }
}

/// Installs the global subscriber and whichever exporters are compiled in.
///
/// # Errors
///
/// An enabled exporter could not be configured (`otlp` without
/// `OTLP_ENDPOINT`, malformed `OTLP_HEADERS`).
pub fn init_telemetry() -> anyhow::Result<Telemetry> {
    let console = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .compact();
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(console);

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semconv::SCHEMA_URL)
        .build();

    #[cfg(feature = "tracing")]
    let (registry, tracer_provider) = {
        opentelemetry::global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );
        let provider = tracer_provider()?;
        opentelemetry::global::set_tracer_provider(provider.clone());
        let layer = tracing_opentelemetry::layer()
            .with_tracer(provider.tracer_with_scope(scope.clone()))
            .with_error_records_to_exceptions(true);
        (registry.with(layer), provider)
    };

    #[cfg(feature = "metrics")]
    let (registry, meter_provider) = {
        let provider = meter_provider()?;
        opentelemetry::global::set_meter_provider(provider.clone());
        let _ = INSTRUMENTS.set(Instruments::new(&opentelemetry::global::meter_with_scope(
            scope,
        )));
        let layer = tracing_opentelemetry::MetricsLayer::new(provider.clone());
        (registry.with(layer), provider)
    };

    registry.init();

    Ok(Telemetry {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

/// Where OTLP exports go.
#[cfg(feature = "otlp")]
struct OtlpTarget {
    endpoint: String,
    headers: std::collections::HashMap<String, String>,
}

#[cfg(feature = "otlp")]
impl OtlpTarget {
    const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;

        let endpoint = std::env::var("OTLP_ENDPOINT").context("missing `OTLP_ENDPOINT`")?;
        let headers = match std::env::var("OTLP_HEADERS") {
            Ok(raw) => parse_headers(&raw)?,
            Err(_) => std::collections::HashMap::new(),
        };
        Ok(Self { endpoint, headers })
    }
}

#[cfg(any(feature = "otlp", test))]
fn parse_headers(raw: &str) -> anyhow::Result<std::collections::HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("malformed OTLP header `{pair}`"))?;
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semconv::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semconv::SCHEMA_URL,
        )
        .build()
}

#[cfg(all(feature = "tracing", any(feature = "stdout", feature = "otlp")))]
fn batched<E>(exporter: E) -> opentelemetry_sdk::trace::BatchSpanProcessor
where
    E: opentelemetry_sdk::trace::SpanExporter + 'static,
{
    opentelemetry_sdk::trace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            opentelemetry_sdk::trace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

#[cfg(feature = "tracing")]
fn tracer_provider() -> anyhow::Result<SdkTracerProvider> {
    let builder = SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder =
        builder.with_span_processor(batched(opentelemetry_stdout::SpanExporter::default()));

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let target = OtlpTarget::from_env()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(target.endpoint)
            .with_headers(target.headers)
            .with_timeout(OtlpTarget::TIMEOUT)
            .build()
            .context("failed to build span exporter")?;
        builder.with_span_processor(batched(exporter))
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
fn meter_provider() -> anyhow::Result<SdkMeterProvider> {
    let builder = SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(
            opentelemetry_stdout::MetricExporter::default(),
        )
        .with_interval(std::time::Duration::from_secs(5))
        .build();
        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let target = OtlpTarget::from_env()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(target.endpoint)
            .with_headers(target.headers)
            .with_timeout(OtlpTarget::TIMEOUT)
            .with_temporality(opentelemetry_sdk::metrics::Temporality::Delta)
            .build()
            .context("failed to build metric exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
static INSTRUMENTS: OnceLock<Instruments> = OnceLock::new();

/// Handles for everything a run reports.
#[cfg(feature = "metrics")]
struct Instruments {
    outcomes: Counter<u64>,
    /// Failed units, by failure code.
    failures: Counter<u64>,
    burst_duration: Histogram<f64>,
    /// Predicate evaluations, by signal and whether it converged.
    poll_attempts: Counter<u64>,
    /// Verdicts, by scenario and status.
    verdicts: Counter<u64>,
}

#[cfg(feature = "metrics")]
impl Instruments {
    fn new(meter: &Meter) -> Self {
        Self {
            outcomes: meter
                .u64_counter("stampede.burst.outcomes")
                .with_description("Work units that produced an outcome")
                .build(),
            failures: meter
                .u64_counter("stampede.burst.failures")
                .with_description("Work units whose outcome was a failure")
                .build(),
            burst_duration: meter
                .f64_histogram("stampede.burst.duration")
                .with_unit("ms")
                .with_description("Time from gate release to the last outcome")
                .build(),
            poll_attempts: meter
                .u64_counter("stampede.poll.attempts")
                .with_description("Convergence predicate evaluations")
                .build(),
            verdicts: meter
                .u64_counter("stampede.verdicts")
                .with_description("Invariant checks recorded")
                .build(),
        }
    }
}

/// Records what one burst produced.
pub fn record_burst(report: &RunReport) {
    #[cfg(feature = "metrics")]
    {
        let Some(metrics) = INSTRUMENTS.get() else {
            return;
        };
        metrics.outcomes.add(report.outcomes.len() as u64, &[]);
        for (code, count) in report.outcomes.failures_by_code() {
            metrics
                .failures
                .add(count as u64, &[KeyValue::new("code", code.to_string())]);
        }
        metrics
            .burst_duration
            .record(report.burst_duration.as_secs_f64() * 1_000.0, &[]);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = report;
}

/// Records how long `signal` was polled for.
pub fn record_convergence(signal: &str, convergence: &Convergence) {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = INSTRUMENTS.get() {
            metrics.poll_attempts.add(
                u64::from(convergence.attempts()),
                &[
                    KeyValue::new("signal", signal.to_string()),
                    KeyValue::new("converged", convergence.is_converged()),
                ],
            );
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (signal, convergence);
}

/// Records every verdict of a finished run.
pub fn record_verdicts(verdicts: &VerdictSet) {
    #[cfg(feature = "metrics")]
    {
        let Some(metrics) = INSTRUMENTS.get() else {
            return;
        };
        for verdict in verdicts.iter() {
            let status = match verdict.status {
                VerdictStatus::Passed => "passed",
                VerdictStatus::Failed { .. } => "failed",
                VerdictStatus::NotConverged { .. } => "not-converged",
            };
            metrics.verdicts.add(
                1,
                &[
                    KeyValue::new("scenario", scenario_of(&verdict.name).to_string()),
                    KeyValue::new("status", status),
                ],
            );
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = verdicts;
}

/// `mq-burst/persistence` belongs to `mq-burst`.
#[cfg(any(feature = "metrics", test))]
fn scenario_of(verdict: &str) -> &str {
    verdict.split_once('/').map_or(verdict, |(scenario, _)| scenario)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otlp_headers_parse_pairs() {
        let headers = parse_headers(" x-api-key = abc ,x-dataset=load,").unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["x-api-key"], "abc");
        assert_eq!(headers["x-dataset"], "load");
        assert!(parse_headers("no-equals-sign").is_err());
    }

    #[test]
    fn verdicts_are_grouped_by_scenario() {
        assert_eq!(scenario_of("mq-burst/persistence"), "mq-burst");
        assert_eq!(scenario_of("cache-protection/negative-cache"), "cache-protection");
        assert_eq!(scenario_of("standalone"), "standalone");
    }

    #[test]
    fn recording_before_init_is_a_no_op() {
        let mut verdicts = VerdictSet::new();
        verdicts.record("idempotency/single-acceptance", Ok(()));
        record_verdicts(&verdicts);
        let waited = Convergence::TimedOut {
            elapsed: core::time::Duration::from_secs(1),
            attempts: 3,
            last_error: None,
        };
        record_convergence("rows", &waited);
    }
}
