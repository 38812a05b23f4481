//! Log subscriber setup shared by the binaries

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Map a `--log-level` value to a tracing level. Unknown values mean info.
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global fmt subscriber. `quiet` caps output at warnings.
pub fn init(level: &str, quiet: bool) {
    let level = if quiet {
        parse_level(level).min(Level::WARN)
    } else {
        parse_level(level)
    };

    let _ = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .try_init();
}
