use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::Compact
    }
}

/// Initializes the global tracing subscriber from `log_filter` (an
/// `EnvFilter` directive string, e.g. `"info,kite_core=debug"`) and
/// `format`. Call once, at process start.
pub fn init(log_filter: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Compact => registry.with(fmt::layer().compact()).init(),
        LogFormat::Json => registry.with(fmt::layer().json().flatten_event(true)).init(),
    }
}
