//! Telemetry initialization
//!
//! Structured JSON logging via tracing-subscriber. Initialized once from
//! the server binary; library crates only emit `tracing` events.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name, recorded as the `service` field on every event
    pub service_name: String,
    /// Emit JSON log lines instead of the human-readable format
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "skyshift".to_string(),
            json: true,
        }
    }
}

/// Initialize the tracing subscriber.
///
/// Respects `RUST_LOG`; defaults to info-level output with debug detail
/// for SkyShift crates and quieted HTTP internals.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,skyshift=debug,tower=warn,hyper=warn,kube=info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true);
        registry.with(fmt_layer).try_init()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        registry.with(fmt_layer).try_init()
    };

    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "skyshift");
        assert!(config.json);
    }
}
