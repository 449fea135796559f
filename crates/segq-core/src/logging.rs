//! Tracing bootstrap shared by binaries and integration harnesses.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config_manager::LoggingConfig;
use crate::error::{Result, SegqError};

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.level` when it is set. Returns an error if a
/// global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format.as_str() {
        "json" => registry.with(fmt::layer().json()).try_init(),
        "compact" => registry.with(fmt::layer().compact()).try_init(),
        _ => registry.with(fmt::layer().pretty()).try_init(),
    };

    result.map_err(|e| SegqError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_reports_error() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
