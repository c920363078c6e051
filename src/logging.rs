//! Tracing subscriber setup.
//!
//! The filter comes from `RELAY_LOG`, then `RUST_LOG`, then
//! `[logging].level`. Logs go to stderr so CLI output on stdout stays
//! clean.

use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}

fn build_env_filter(
    default_level: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<EnvFilter, LoggingError> {
    let set = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());
    let directives = set("RELAY_LOG")
        .or_else(|| set("RUST_LOG"))
        .unwrap_or_else(|| default_level.to_string());
    Ok(EnvFilter::try_new(directives)?)
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_env_filter(&config.level, |key| std::env::var(key).ok())?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match config.format.as_str() {
        "json" => builder.json().with_current_span(true).try_init(),
        "compact" => builder.compact().with_target(false).try_init(),
        _ => builder.pretty().try_init(),
    };
    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_log_takes_precedence() {
        let filter = build_env_filter("info", |key| match key {
            "RELAY_LOG" => Some("relay_harness=trace".into()),
            "RUST_LOG" => Some("warn".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(filter.to_string(), "relay_harness=trace");
    }

    #[test]
    fn empty_relay_log_falls_through_to_rust_log() {
        let filter = build_env_filter("info", |key| match key {
            "RELAY_LOG" => Some("  ".into()),
            "RUST_LOG" => Some("warn".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn falls_back_to_configured_level() {
        let filter = build_env_filter("debug", |_| None).unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn rejects_malformed_directives() {
        assert!(build_env_filter("info", |_| Some("foo=notalevel".into())).is_err());
    }
}
