//! Logging Setup
//!
//! `RUST_LOG` always wins; otherwise the level comes from `--debug`. Output is
//! human readable unless `--log-json` or `LOG_FORMAT=json` asks for one JSON
//! object per line.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable selecting the output format
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub debug: bool,
    pub json: bool,
}

impl LogOptions {
    /// Combine flags with `LOG_FORMAT`
    pub fn from_env(debug: bool, json: bool) -> Self {
        let json = json || std::env::var(LOG_FORMAT_ENV).is_ok_and(|format| format.eq_ignore_ascii_case("json"));
        Self { debug, json }
    }

    /// Directive used when `RUST_LOG` is unset
    pub fn default_directive(&self) -> &'static str {
        if self.debug {
            "debug,hyper=info,h2=info,tower=info,rustls=info,tungstenite=info"
        } else {
            "info"
        }
    }
}

/// Install the global subscriber
pub fn init(options: LogOptions) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(options.default_directive()));
    let registry = tracing_subscriber::registry().with(filter);

    if options.json {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_follows_debug() {
        assert_eq!(LogOptions::default().default_directive(), "info");
        let debug = LogOptions { debug: true, json: false };
        assert!(debug.default_directive().starts_with("debug"));
    }

    #[test]
    fn test_json_flag_wins() {
        assert!(LogOptions::from_env(false, true).json);
    }

    #[test]
    fn test_second_init_fails_cleanly() {
        let _ = init(LogOptions::default());
        assert!(init(LogOptions::default()).is_err());
    }
}
