use crate::{env_optional, env_or_default, Environment};
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Install color-eyre with a project-standard configuration.
///
/// Call this early in main() before any fallible operation. Safe to call
/// multiple times.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Logging configuration
///
/// - `LOG_FORMAT`: `json` or `pretty` (defaults to json in production)
/// - `LOG_LEVEL`: default filter when `RUST_LOG` is unset (default `info`)
/// - `LOG_COMPONENT`: service name attached to the startup event
#[derive(Clone, Debug)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
    pub component: Option<String>,
    pub environment: Environment,
}

impl LogConfig {
    pub fn from_env() -> Self {
        let environment = Environment::from_env();
        let format = match env_optional("LOG_FORMAT").as_deref() {
            Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
            Some(f) if f.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ if environment.is_production() => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Self {
            format,
            level: env_or_default("LOG_LEVEL", "info"),
            component: env_optional("LOG_COMPONENT"),
            environment,
        }
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: "info".to_string(),
            component: None,
            environment: Environment::Development,
        }
    }
}

/// Initialize tracing with an `EnvFilter`, the configured output format and
/// `tracing_error::ErrorLayer` for span-trace capture.
///
/// `RUST_LOG` overrides `LOG_LEVEL`. Safe to call multiple times: a second
/// call leaves the first subscriber in place (common in tests).
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init(),
    };

    match result {
        Ok(_) => {
            info!(
                component = config.component.as_deref().unwrap_or("unknown"),
                environment = ?config.environment,
                format = ?config.format,
                "Tracing initialized"
            );
        }
        Err(_) => {
            debug!("Tracing already initialized, skipping re-initialization");
        }
    }
}
