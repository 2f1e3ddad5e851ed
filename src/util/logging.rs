use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;

use crate::config::LogLevel;

/// Map a configured level onto a log filter
pub fn level_filter(level: &LogLevel) -> LevelFilter {
    match level {
        LogLevel::Error => LevelFilter::Error,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace => LevelFilter::Trace,
    }
}

/// Initialize the logging system.
/// Later calls are ignored once a logger is installed.
pub fn init(level: &LogLevel) {
    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level_filter(level));

    if builder.try_init().is_err() {
        log::debug!("Logger already initialised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_filter(&LogLevel::Warn), LevelFilter::Warn);
        assert_eq!(level_filter(&LogLevel::default()), LevelFilter::Info);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(&LogLevel::Debug);
        init(&LogLevel::Trace);
    }
}
