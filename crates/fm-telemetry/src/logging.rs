use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Output shape of the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Compact single-line text for a terminal.
    Text,
    /// Flattened JSON for log shippers.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// How the subscriber is installed; built by the daemon from its config
/// section (`general.log_level`, `general.log_format`).
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Install the global subscriber once for this service.
///
/// `RUST_LOG` still wins when set; otherwise the configured level applies.
/// Safe to call multiple times (e.g. in tests) -- subsequent calls are
/// no-ops.
pub fn init_logging(service_name: &str, options: &LogOptions) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::new(&options.level),
    };

    let installed = match options.format {
        LogFormat::Text => fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
        LogFormat::Json => fmt()
            .json()
            .flatten_event(true)
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(true)
            .try_init(),
    };

    if installed.is_ok() {
        tracing::info!(
            service = service_name,
            format = ?options.format,
            level = %options.level,
            "logging initialised"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_known_values() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn init_is_idempotent() {
        let options = LogOptions::default();
        init_logging("fm-test", &options);
        // A second call (and a format flip) must not panic.
        init_logging(
            "fm-test",
            &LogOptions {
                level: "debug".into(),
                format: LogFormat::Json,
            },
        );
    }
}
