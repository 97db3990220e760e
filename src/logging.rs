use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

const LOG_ENV: &str = "DAQSTREAM_LOG";

static INIT: Once = Once::new();

/// Level from `DAQSTREAM_LOG`, then `RUST_LOG`, defaulting to `info`.
pub fn env_level() -> LevelFilter {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

fn level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Install the stderr logger. Only the first call has any effect; later calls
/// (or a logger installed by someone else) are left alone.
pub fn init_logging() {
    init_logging_with(env_level());
}

/// Like [`init_logging`] with an explicit default level. A filter in
/// `DAQSTREAM_LOG` (module directives allowed) still takes precedence.
pub fn init_logging_with(level: LevelFilter) {
    INIT.call_once(|| {
        let env = Env::new().filter_or(LOG_ENV, level_name(level));
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}
