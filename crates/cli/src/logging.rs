//! Structured logging setup for the `hearth` binary.
//!
//! Logs go to stderr so that `--format json` output on stdout stays parseable.
//! `RUST_LOG` takes precedence over everything configured here; otherwise the
//! `hearth*` crates log at the configured level and HTTP plumbing is held at
//! `warn`.

use std::env;
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

const QUIET_TARGETS: &[&str] = &["h2", "hyper", "hyper_util", "reqwest"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: Level,
    /// One JSON object per line instead of the human formatter.
    pub use_json: bool,
    pub include_target: bool,
    pub include_location: bool,
    pub include_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            use_json: false,
            include_target: true,
            include_location: false,
            include_thread_ids: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            use_json: true,
            include_target: true,
            include_location: true,
            include_thread_ids: true,
        }
    }

    /// Reads `HEARTH_LOG_LEVEL` and `HEARTH_LOG_JSON`.
    pub fn from_env() -> Self {
        let level = env::var("HEARTH_LOG_LEVEL")
            .map(|l| parse_level(&l))
            .unwrap_or(Level::INFO);
        let use_json = env::var("HEARTH_LOG_JSON")
            .ok()
            .and_then(|v| parse_bool(&v))
            .unwrap_or(false);

        Self {
            level,
            use_json,
            ..Default::default()
        }
    }

    /// Command-line flags over the environment: an explicit `--log-level`
    /// wins, then `-v` / `-q`, then `HEARTH_LOG_LEVEL`.
    pub fn from_args(log_level: Option<&str>, verbose: bool, quiet: bool) -> Self {
        let mut config = Self::from_env();
        if let Some(level) = log_level {
            config.level = parse_level(level);
        } else if verbose {
            config.level = Level::DEBUG;
        } else if quiet {
            config.level = Level::ERROR;
        }
        config
    }

    /// Filter directives used when `RUST_LOG` is unset.
    pub fn directives(&self) -> Vec<String> {
        let mut directives = vec![format!("hearth={}", self.level)];
        directives.extend(QUIET_TARGETS.iter().map(|t| format!("{}=warn", t)));
        directives
    }
}

/// Unknown levels fall back to `INFO` with a warning on stderr.
pub fn parse_level(level_str: &str) -> Level {
    match level_str.trim().to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => {
            eprintln!(
                "Invalid log level '{}', defaulting to INFO. Valid levels: trace, debug, info, warn, error",
                level_str
            );
            Level::INFO
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    if env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    config
        .directives()
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(EnvFilter::new("warn"), |filter, d| filter.add_directive(d))
}

/// Installs the global subscriber. Later calls are ignored.
pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        let filter = build_filter(&config);
        let registry = tracing_subscriber::registry().with(filter);

        let result = if config.use_json {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(std::io::stderr)
                        .with_target(config.include_target)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location)
                        .with_thread_ids(config.include_thread_ids)
                        .with_thread_names(config.include_thread_ids),
                )
                .try_init()
        } else {
            registry
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(config.include_target)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location)
                        .with_thread_ids(config.include_thread_ids)
                        .with_thread_names(config.include_thread_ids),
                )
                .try_init()
        };

        if let Err(e) = result {
            eprintln!("Failed to initialize logging: {}", e);
        }
    });
}

pub fn init_default() {
    init_logging(LoggingConfig::default());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        keys: Vec<&'static str>,
    }

    impl EnvGuard {
        fn new(keys: &[&'static str]) -> Self {
            for key in keys {
                env::remove_var(key);
            }
            Self {
                keys: keys.to_vec(),
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for key in &self.keys {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("trace"), Level::TRACE);
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level(" info "), Level::INFO);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("Error"), Level::ERROR);
        assert_eq!(parse_level("loud"), Level::INFO);
    }

    #[test]
    fn test_default_and_production() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.use_json);

        let config = LoggingConfig::production();
        assert!(config.use_json);
        assert!(config.include_location);
    }

    #[test]
    fn test_directives_cover_all_crates() {
        let directives = LoggingConfig::with_level(Level::DEBUG).directives();
        assert_eq!(directives[0], "hearth=debug");
        assert!(directives.contains(&"reqwest=warn".to_string()));
        assert!(directives
            .iter()
            .all(|d| d.parse::<Directive>().is_ok()));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&["HEARTH_LOG_LEVEL", "HEARTH_LOG_JSON"]);
        env::set_var("HEARTH_LOG_LEVEL", "trace");
        env::set_var("HEARTH_LOG_JSON", "true");

        let config = LoggingConfig::from_env();
        assert_eq!(config.level, Level::TRACE);
        assert!(config.use_json);
    }

    #[test]
    #[serial]
    fn test_flag_precedence() {
        let _guard = EnvGuard::new(&["HEARTH_LOG_LEVEL", "HEARTH_LOG_JSON"]);
        env::set_var("HEARTH_LOG_LEVEL", "warn");

        assert_eq!(LoggingConfig::from_args(None, false, false).level, Level::WARN);
        assert_eq!(LoggingConfig::from_args(None, true, false).level, Level::DEBUG);
        assert_eq!(LoggingConfig::from_args(None, false, true).level, Level::ERROR);
        assert_eq!(
            LoggingConfig::from_args(Some("trace"), false, true).level,
            Level::TRACE
        );
    }
}
