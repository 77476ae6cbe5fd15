//! Minimal `log` backend writing colored records to stderr.

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::io::Write;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

struct StderrLogger {
    stream: Mutex<StandardStream>,
}

fn level_color(level: Level) -> Color {
    match level {
        Level::Error => Color::Red,
        Level::Warn => Color::Yellow,
        Level::Info => Color::Green,
        Level::Debug => Color::Cyan,
        Level::Trace => Color::Magenta,
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut stream = self.stream.lock();
        let mut spec = ColorSpec::new();
        spec.set_fg(Some(level_color(record.level()))).set_bold(true);
        let _ = stream.set_color(&spec);
        let _ = write!(stream, "{:>5}", record.level());
        let _ = stream.reset();
        let _ = writeln!(stream, " {}: {}", record.target(), record.args());
    }

    fn flush(&self) {
        let _ = self.stream.lock().flush();
    }
}

/// Install the stderr logger. Later calls only adjust the level.
pub fn init(level: LevelFilter, choice: ColorChoice) {
    let logger = StderrLogger {
        stream: Mutex::new(StandardStream::stderr(choice)),
    };
    if log::set_logger(Box::leak(Box::new(logger))).is_err() {
        log::debug!("logger already installed");
    }
    log::set_max_level(level);
}

/// `-v` count, then `FERRY_LOG`, then the configured level.
pub fn resolve_level(verbose: u8, env: Option<&str>, configured: &str) -> LevelFilter {
    match verbose {
        0 => {}
        1 => return LevelFilter::Debug,
        _ => return LevelFilter::Trace,
    }
    env.and_then(ferry_runtime::log_level)
        .or_else(|| ferry_runtime::log_level(configured))
        .unwrap_or(LevelFilter::Info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_priority() {
        assert_eq!(resolve_level(2, Some("warn"), "error"), LevelFilter::Trace);
        assert_eq!(resolve_level(1, None, "error"), LevelFilter::Debug);
        assert_eq!(resolve_level(0, Some("warn"), "error"), LevelFilter::Warn);
        assert_eq!(resolve_level(0, Some("loud"), "error"), LevelFilter::Error);
        assert_eq!(resolve_level(0, None, "nonsense"), LevelFilter::Info);
    }
}
