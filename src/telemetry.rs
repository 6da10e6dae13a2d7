// Structured logging with tracing.
//
// RUST_LOG overrides the configured level; output is pretty or JSON, to
// the console or to a rotating file.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// "trace", "debug", "info", "warn", "error"
    pub log_level: String,
    /// "json" or "pretty"
    pub log_format: String,
    /// None = console only
    pub log_file: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_file: None,
        }
    }
}

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Install the global tracing subscriber. Safe to call more than once;
/// later calls are no-ops (tests share one process).
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if let Some(log_file_path) = &config.log_file {
        let path = std::path::Path::new(log_file_path);
        let directory = path
            .parent()
            .ok_or_else(|| Error::invalid_input("log file path has no parent directory"))?;
        let prefix = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| Error::invalid_input("log file path has no file name"))?;

        let appender = tracing_appender::rolling::daily(directory, prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // The guard must outlive the process or buffered lines are lost.
        std::mem::forget(guard);

        if config.log_format == "json" {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(writer))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(false).with_writer(writer))
                .init();
        }
    } else if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .init();
    }

    let _ = INITIALIZED.set(());
    Ok(())
}

/// Truncate a hash or address for log lines.
///
/// Example: "0a1b2c3d4e5f67890a1b2c3d4e5f6789" → "0a1b2c3d4e5f6789..."
pub fn truncate_hex(hex: &str, len: usize) -> String {
    if hex.len() <= len {
        hex.to_string()
    } else {
        format!("{}...", &hex[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_hex_only() {
        assert_eq!(truncate_hex("abcd", 16), "abcd");
        assert_eq!(
            truncate_hex("0123456789abcdef0123456789abcdef", 16),
            "0123456789abcdef..."
        );
        assert_eq!(truncate_hex("", 16), "");
    }
}
