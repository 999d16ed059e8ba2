//! Log level handling driven by `CHARON_LOGGING`
//!
//! charon is usually invoked by another tool, so stdout is reserved for the
//! response JSON and all diagnostics go to stderr.

use crate::api;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

/// Verbosity levels, lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    Off,
    Basic,
    Debug,
}

impl LogLevel {
    /// Parse a level from `CHARON_LOGGING` syntax: names or digits.
    /// Unknown values fall back to `Off`.
    pub fn from_str(s: &str) -> Self {
        if let Ok(n) = s.parse::<i64>() {
            return match n {
                i64::MIN..=0 => Self::Off,
                1 => Self::Basic,
                _ => Self::Debug,
            };
        }
        match s.to_ascii_lowercase().as_str() {
            "basic" => Self::Basic,
            "debug" => Self::Debug,
            _ => Self::Off,
        }
    }

    fn filter_directive(self) -> &'static str {
        match self {
            Self::Off => "charon=error",
            Self::Basic => "charon=info",
            Self::Debug => "charon=debug",
        }
    }
}

static LEVEL: OnceLock<LogLevel> = OnceLock::new();

/// The level parsed from the environment, fixed for the process lifetime.
pub fn level() -> LogLevel {
    *LEVEL.get_or_init(|| {
        std::env::var(api::env::LOGGING)
            .map(|v| LogLevel::from_str(&v))
            .unwrap_or_default()
    })
}

/// Whether debug logging is on. Controls the agent stdout/stderr redirection
/// in the client launcher.
pub fn debug_enabled() -> bool {
    level() >= LogLevel::Debug
}

/// Install the global tracing subscriber, writing to stderr.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level().filter_directive()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_names() {
        assert_eq!(LogLevel::from_str("off"), LogLevel::Off);
        assert_eq!(LogLevel::from_str("BASIC"), LogLevel::Basic);
        assert_eq!(LogLevel::from_str("Debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("bogus"), LogLevel::Off);
    }

    #[test]
    fn parse_digits() {
        assert_eq!(LogLevel::from_str("0"), LogLevel::Off);
        assert_eq!(LogLevel::from_str("1"), LogLevel::Basic);
        assert_eq!(LogLevel::from_str("2"), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("7"), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("-3"), LogLevel::Off);
    }
}
