//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use taskflow_types::config::LoggingConfig;
//!
//! // Human-readable logs, filter from RUST_LOG or "info"
//! taskflow_observe::init_tracing(&LoggingConfig::default()).unwrap();
//!
//! // ... run executions ...
//! taskflow_observe::shutdown_tracing();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use taskflow_types::config::LoggingConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "info";

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Initialize the global tracing subscriber from `config`.
///
/// - Filter: `config.filter`, else `RUST_LOG`, else `info`.
/// - A `fmt` layer with targets and span-close timing, as JSON lines when
///   `config.json` is set.
/// - When `config.otel_stdout` is set, spans are also bridged to
///   OpenTelemetry with the stdout exporter.
///
/// # Errors
///
/// Returns an error if the filter directive does not parse or a global
/// subscriber has already been installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let directive = filter_directive(
        config.filter.as_deref(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
    );
    let env_filter = EnvFilter::try_new(&directive)?;

    let (json_layer, text_layer) = if config.json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE);
        (Some(layer), None)
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE);
        (None, Some(layer))
    };

    let otel_layer = if config.otel_stdout {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("taskflow");
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()?;

    tracing::debug!(filter = %directive, json = config.json, otel = config.otel_stdout, "tracing initialized");
    Ok(())
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// Safe to call when OTel was not enabled (no-op in that case).
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

fn filter_directive(configured: Option<&str>, from_env: Option<String>) -> String {
    configured
        .map(str::to_string)
        .or(from_env)
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive_precedence() {
        assert_eq!(
            filter_directive(Some("taskflow_core=debug"), Some("warn".to_string())),
            "taskflow_core=debug"
        );
        assert_eq!(filter_directive(None, Some("warn".to_string())), "warn");
        assert_eq!(filter_directive(None, None), "info");
        assert_eq!(filter_directive(Some("  "), None), "info");
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = LoggingConfig {
            filter: Some("taskflow_core=loud".to_string()),
            ..LoggingConfig::default()
        };
        assert!(init_tracing(&config).is_err());
    }

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig {
            filter: Some("warn".to_string()),
            json: true,
            otel_stdout: false,
        };
        // Another test in this binary may have won the race to install.
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
        shutdown_tracing();
    }
}
