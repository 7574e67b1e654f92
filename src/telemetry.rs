//! Tracing subscriber setup for embedding applications

use tracing_subscriber::EnvFilter;

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directive` (e.g. `"glance=info"`)
/// is used. Returns false when a global subscriber was already installed.
pub fn init_tracing(default_directive: &str, format: LogFormat) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.is_ok()
}
