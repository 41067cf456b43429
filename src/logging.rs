//! Leveled logging configured from the `LOG_LEVEL` environment variable.

use log::LevelFilter;

/// `debug | info | warn | error | silent` — anything else falls back to info.
pub fn level_from_str(s: &str) -> LevelFilter {
    match s.to_ascii_lowercase().as_str() {
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "silent" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Install the process-wide logger. Safe to call more than once; later calls
/// are no-ops.
pub fn init() {
    let level = std::env::var("LOG_LEVEL")
        .map(|v| level_from_str(&v))
        .unwrap_or(LevelFilter::Info);

    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init();
}
