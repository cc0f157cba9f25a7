//! Tracing setup for scalelink binaries.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `SCALELINK_LOG_FORMAT=json` | Newline-delimited JSON instead of compact text. |
//! | `SCALELINK_OTLP_ENDPOINT` | Export spans over OTLP/HTTP to this collector. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | Fallback when the variable above is unset. |
//!
//! ```rust,no_run
//! let _guard = scalelink_runtime::telemetry::init_tracing("scalelink");
//! ```

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

const ENDPOINT_VARS: [&str; 2] = ["SCALELINK_OTLP_ENDPOINT", "OTEL_EXPORTER_OTLP_ENDPOINT"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Compact,
    Json,
}

/// What [`init_tracing`] installs, resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TelemetrySettings {
    service_name: String,
    format: LogFormat,
    otlp_endpoint: Option<String>,
}

impl TelemetrySettings {
    fn from_lookup(service_name: &str, var: impl Fn(&str) -> Option<String>) -> Self {
        let format = match var("SCALELINK_LOG_FORMAT") {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };
        let otlp_endpoint = ENDPOINT_VARS
            .iter()
            .filter_map(|name| var(*name))
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty());
        Self {
            service_name: service_name.to_string(),
            format,
            otlp_endpoint,
        }
    }

    /// Spans carry the binary's name and the scalelink release.
    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes([
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                KeyValue::new("service.namespace", "scalelink"),
            ])
            .build()
    }
}

/// Install the global subscriber.  Hold the returned guard until exit.
///
/// Calling it twice in one process is harmless; the second call keeps the
/// first subscriber.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let settings = TelemetrySettings::from_lookup(service_name, |name| std::env::var(name).ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let provider = settings.otlp_endpoint.as_deref().and_then(|endpoint| {
        match opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
        {
            // Simple exporter: the CLI starts its Tokio runtime after this
            // runs, so nothing may spawn tasks here.
            Ok(exporter) => Some(
                SdkTracerProvider::builder()
                    .with_resource(settings.resource())
                    .with_simple_exporter(exporter)
                    .build(),
            ),
            Err(e) => {
                eprintln!("[scalelink] OTLP exporter for {endpoint} failed: {e}");
                None
            }
        }
    });

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if let Some(p) = &provider {
        let tracer = p.tracer("scalelink");
        layers.push(Box::new(tracing_opentelemetry::layer().with_tracer(tracer)));
    }
    layers.push(match settings.format {
        LogFormat::Json => Box::new(tracing_subscriber::fmt::layer().json()),
        LogFormat::Compact => Box::new(tracing_subscriber::fmt::layer().compact()),
    });

    if let Err(e) = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
    {
        eprintln!("[scalelink] tracing already initialised: {e}");
    }

    TracerProviderGuard(provider)
}

/// Flushes and shuts the OTLP exporter down on drop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[scalelink] OpenTelemetry shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> TelemetrySettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TelemetrySettings::from_lookup("scalelink-test", |name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_to_compact_logs_without_export() {
        let s = settings(&[]);
        assert_eq!(s.format, LogFormat::Compact);
        assert_eq!(s.otlp_endpoint, None);
    }

    #[test]
    fn scalelink_endpoint_wins_over_otel_default() {
        let s = settings(&[
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4318"),
            ("SCALELINK_OTLP_ENDPOINT", " http://barn-pc:4318 "),
            ("SCALELINK_LOG_FORMAT", "JSON"),
        ]);
        assert_eq!(s.otlp_endpoint.as_deref(), Some("http://barn-pc:4318"));
        assert_eq!(s.format, LogFormat::Json);

        let s = settings(&[
            ("SCALELINK_OTLP_ENDPOINT", "  "),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4318"),
        ]);
        assert_eq!(s.otlp_endpoint.as_deref(), Some("http://collector:4318"));
    }

    #[test]
    fn resource_names_the_service() {
        let resource = settings(&[]).resource();
        let attrs: HashMap<String, String> = resource
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_string()))
            .collect();
        assert_eq!(attrs.get("service.name").map(String::as_str), Some("scalelink-test"));
        assert_eq!(
            attrs.get("service.version").map(String::as_str),
            Some(env!("CARGO_PKG_VERSION"))
        );
    }

    #[test]
    fn empty_guard_drops_cleanly() {
        let guard = TracerProviderGuard(None);
        assert!(!guard.is_exporting());
        drop(guard);
    }
}
