//! # Logging Setup
//!
//! Installs a `tracing-subscriber` formatter driven by [`LoggingConfig`].
//!
//! `RUST_LOG` wins over the configured level when it is set. Calling
//! [`init_logging`] more than once is harmless: the first subscriber stays installed.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    if !config.log_to_console {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.as_str().to_lowercase()))
        .map_err(|e| ProtocolError::Config(format!("Invalid log filter: {e}")))?;

    let builder = fmt().with_env_filter(filter).with_target(true);

    // try_init fails only when a subscriber is already set
    let installed = if config.json_format {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_init_twice_is_ok() {
        let config = LoggingConfig::default();
        init_logging(&config).unwrap();
        init_logging(&config).unwrap();
    }

    #[test]
    fn test_console_disabled_is_noop() {
        let config = LoggingConfig {
            log_to_console: false,
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_ok());
    }
}
