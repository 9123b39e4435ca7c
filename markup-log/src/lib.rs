//! Logging setup for markup-sync.
//!
//! All markup-sync crates log through the [`tracing`] macros with structured
//! fields. This crate owns the one-time subscriber installation so binaries
//! and tests configure output the same way.
//!
//! # Usage
//!
//! ```rust
//! use markup_log::LogConfig;
//!
//! // Reads MARKUP_* variables and installs a global subscriber.
//! markup_log::init();
//!
//! markup_log::info!(job_id = "abc", "job submitted");
//!
//! let config = LogConfig::default();
//! assert_eq!(config.level, markup_log::Level::Info);
//! ```
//!
//! # Environment Variables
//!
//! - `MARKUP_DEBUG=1` - Enable debug logging
//! - `MARKUP_LOG_LEVEL=trace|debug|info|warn|error|off` - Set log level
//! - `MARKUP_LOG_FORMAT=pretty|compact|json` - Set output format
//! - `MARKUP_LOG_COLOR=1|0` - Enable/disable ANSI colors
//!
//! `RUST_LOG`, when set, takes precedence over the level variables.

use std::env;
use std::sync::OnceLock;
pub use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

// ============================================================================
// Log Levels
// ============================================================================

/// Minimum level emitted by the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Trace level (most verbose)
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warning level
    Warn,
    /// Error level
    Error,
    /// No logging
    Off,
}

impl Level {
    /// Parse a level name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "off" | "none" => Some(Level::Off),
            _ => None,
        }
    }

    /// Directive understood by [`EnvFilter`].
    pub fn as_directive(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Off => "off",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_directive())
    }
}

// ============================================================================
// Log Format
// ============================================================================

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Multi-line human readable output
    Pretty,
    /// Single-line human readable output
    Compact,
    /// One JSON object per line
    Json,
}

impl Format {
    /// Parse a format name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Some(Format::Pretty),
            "compact" => Some(Format::Compact),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether ANSI colors are enabled
    pub color: bool,
    /// Whether to include the event target (module path)
    pub targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Json,
            color: false,
            targets: true,
        }
    }
}

impl LogConfig {
    /// Build the configuration from `MARKUP_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"));

        let debug = flag("MARKUP_DEBUG").unwrap_or(false);

        let level = lookup("MARKUP_LOG_LEVEL")
            .and_then(|s| Level::parse(&s))
            .unwrap_or(if debug { Level::Debug } else { Level::Info });

        let format = lookup("MARKUP_LOG_FORMAT")
            .and_then(|s| Format::parse(&s))
            .unwrap_or(Format::Json);

        // JSON output never carries escape codes.
        let color = format != Format::Json
            && flag("MARKUP_LOG_COLOR")
                .unwrap_or_else(|| lookup("NO_COLOR").is_none() && lookup("TERM").is_some());

        let targets = flag("MARKUP_LOG_TARGETS").unwrap_or(true);

        Self {
            level,
            format,
            color,
            targets,
        }
    }

    /// Set the level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the format.
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_directive()))
    }
}

// ============================================================================
// Subscriber installation
// ============================================================================

static INSTALLED: OnceLock<LogConfig> = OnceLock::new();

/// Install the global subscriber using [`LogConfig::from_env`].
///
/// Calling this more than once is harmless; only the first call installs.
pub fn init() {
    init_with(LogConfig::from_env());
}

/// Install the global subscriber with an explicit configuration.
///
/// Returns `false` when a subscriber was already installed, either by an
/// earlier call or by another library.
pub fn init_with(config: LogConfig) -> bool {
    if INSTALLED.get().is_some() {
        return false;
    }

    let installed = match config.format {
        Format::Pretty => tracing_subscriber::registry()
            .with(config.filter())
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(config.color)
                    .with_target(config.targets),
            )
            .try_init()
            .is_ok(),
        Format::Compact => tracing_subscriber::registry()
            .with(config.filter())
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(config.color)
                    .with_target(config.targets),
            )
            .try_init()
            .is_ok(),
        #[cfg(feature = "json")]
        Format::Json => tracing_subscriber::registry()
            .with(config.filter())
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(config.targets),
            )
            .try_init()
            .is_ok(),
        #[cfg(not(feature = "json"))]
        Format::Json => tracing_subscriber::registry()
            .with(config.filter())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(config.targets),
            )
            .try_init()
            .is_ok(),
    };

    if installed {
        let _ = INSTALLED.set(config);
    }
    installed
}

/// Configuration of the installed subscriber, if [`init`] succeeded.
pub fn installed_config() -> Option<&'static LogConfig> {
    INSTALLED.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Off);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(Level::parse("debug"), Some(Level::Debug));
        assert_eq!(Level::parse("DEBUG"), Some(Level::Debug));
        assert_eq!(Level::parse("warning"), Some(Level::Warn));
        assert_eq!(Level::parse("none"), Some(Level::Off));
        assert_eq!(Level::parse("loud"), None);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(Format::parse("pretty"), Some(Format::Pretty));
        assert_eq!(Format::parse("Compact"), Some(Format::Compact));
        assert_eq!(Format::parse("json"), Some(Format::Json));
        assert_eq!(Format::parse("xml"), None);
    }

    #[test]
    fn test_defaults_without_env() {
        let config = LogConfig::from_lookup(lookup(&[]));
        assert_eq!(config.level, Level::Info);
        assert_eq!(config.format, Format::Json);
        assert!(!config.color);
        assert!(config.targets);
    }

    #[test]
    fn test_debug_flag_lowers_level() {
        let config = LogConfig::from_lookup(lookup(&[("MARKUP_DEBUG", "true")]));
        assert_eq!(config.level, Level::Debug);
    }

    #[test]
    fn test_explicit_level_wins_over_debug() {
        let config = LogConfig::from_lookup(lookup(&[
            ("MARKUP_DEBUG", "1"),
            ("MARKUP_LOG_LEVEL", "warn"),
        ]));
        assert_eq!(config.level, Level::Warn);
    }

    #[test]
    fn test_color_never_applies_to_json() {
        let config = LogConfig::from_lookup(lookup(&[
            ("MARKUP_LOG_FORMAT", "json"),
            ("MARKUP_LOG_COLOR", "1"),
        ]));
        assert!(!config.color);

        let config = LogConfig::from_lookup(lookup(&[
            ("MARKUP_LOG_FORMAT", "pretty"),
            ("MARKUP_LOG_COLOR", "1"),
        ]));
        assert!(config.color);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_with(LogConfig::default().with_format(Format::Compact));
        assert!(!init_with(LogConfig::default()));
    }
}
