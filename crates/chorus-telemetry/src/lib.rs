mod metrics;

pub use crate::metrics::names;
pub use crate::metrics::{build_detached_handle, install_recorder};
pub use metrics_exporter_prometheus::PrometheusHandle;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "chorus_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Install the Prometheus recorder behind `/metrics`.
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            metrics_enabled: true,
        }
    }
}

/// Handles kept alive for the lifetime of the process.
pub struct TelemetryGuard {
    prometheus: Option<PrometheusHandle>,
}

impl TelemetryGuard {
    /// Handle for rendering the `/metrics` endpoint, if metrics are enabled.
    pub fn prometheus(&self) -> Option<PrometheusHandle> {
        self.prometheus.clone()
    }
}

/// Build the filter directive string from config.
pub fn filter_directives(config: &TelemetryConfig) -> String {
    let mut filter_str = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// A second call leaves the first subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config)));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
    {
        eprintln!("chorus-telemetry: subscriber already installed: {e}");
    }

    let prometheus = if config.metrics_enabled {
        install_recorder()
    } else {
        None
    };

    TelemetryGuard { prometheus }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_is_info() {
        let config = TelemetryConfig::default();
        assert_eq!(filter_directives(&config), "info");
    }

    #[test]
    fn module_levels_appended() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![
                ("chorus_store".into(), Level::DEBUG),
                ("chorus_server::relay".into(), Level::TRACE),
            ],
            ..TelemetryConfig::default()
        };
        assert_eq!(
            filter_directives(&config),
            "warn,chorus_store=debug,chorus_server::relay=trace"
        );
    }

    #[test]
    fn metrics_can_be_disabled() {
        let guard = init_telemetry(TelemetryConfig {
            metrics_enabled: false,
            ..TelemetryConfig::default()
        });
        assert!(guard.prometheus().is_none());
    }
}
