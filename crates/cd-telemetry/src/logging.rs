use tracing_subscriber::{fmt, EnvFilter};

/// Output format of the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact lines for a terminal.
    #[default]
    Human,
    /// One JSON object per line, with the event fields flattened.
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Human
        }
    }
}

/// `RUST_LOG` when set, otherwise `default_level` (e.g. "info" or
/// "cd_daemon=debug,warn").
fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber. Only the first call in a process takes
/// effect; later calls are no-ops, which keeps tests free to call it.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) {
    let installed = match format {
        LogFormat::Human => fmt()
            .with_env_filter(filter(default_level))
            .with_target(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
        LogFormat::Json => fmt()
            .json()
            .flatten_event(true)
            .with_env_filter(filter(default_level))
            .with_current_span(false)
            .try_init()
            .is_ok(),
    };
    if installed {
        tracing::info!(service = service_name, ?format, "logging initialised");
    }
}

pub fn init_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Human);
}

pub fn init_logging_json(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Json);
}
