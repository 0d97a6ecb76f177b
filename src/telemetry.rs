// src/telemetry.rs
//
// Logging bootstrap. `RUST_LOG` wins over the configured level when set.

use crate::settings::LogSettings;
use anyhow::Result;

/// Installs the process-wide logger: `env_logger` by default, a `tracing-subscriber`
/// fmt layer (plain or JSON) with the `observability` feature.
#[cfg(not(feature = "observability"))]
pub fn init_logging(settings: &LogSettings) -> Result<()> {
    use crate::settings::LogFormat;

    if settings.format == LogFormat::Json {
        log::warn!("JSON log format requires the `observability` feature, using plain output");
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&settings.level))
        .format_timestamp_millis()
        .try_init()?;
    Ok(())
}

#[cfg(feature = "observability")]
pub fn init_logging(settings: &LogSettings) -> Result<()> {
    use crate::settings::LogFormat;
    use std::str::FromStr;
    use tracing::Level;

    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|value| Level::from_str(value.trim()).ok())
        .or_else(|| Level::from_str(&settings.level).ok())
        .unwrap_or(Level::INFO);

    let builder = tracing_subscriber::fmt().with_max_level(level).with_target(true);
    match settings.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Plain => builder.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_rejected() {
        let settings = LogSettings::default();
        let _ = init_logging(&settings);
        assert!(init_logging(&settings).is_err());
    }
}
