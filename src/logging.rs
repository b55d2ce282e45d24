//! Tracing infrastructure
//!
//! Structured logging for drivers and the `meddump` tool, built on `tracing` and
//! `tracing-subscriber`:
//! - Multiple output formats (pretty, compact, JSON)
//! - Environment-based filtering (`RUST_LOG` overrides the configured level)
//! - Mapping of the numeric `verbosity` device option to a log level
//!
//! Sessions do not consult any global verbosity. Each one owns a [`tracing::Span`]
//! created at construction (see [`device_span`]) and enters it around every
//! operation, so all events carry the device they belong to.
//!
//! # Example
//! ```no_run
//! use med_eeg::logging::{self, TracingConfig};
//! use tracing::Level;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! logging::init(TracingConfig::new(Level::DEBUG))?;
//! tracing::info!("acquisition started");
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use tracing::{Level, Span};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact format without colors
    Compact,
    /// JSON format for structured logging
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                s
            )),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include span events (NEW, CLOSE)
    pub with_span_events: bool,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to enable ANSI colors (only for Pretty format)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create tracing config with custom settings
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Create tracing config from the numeric `verbosity` device option.
    ///
    /// At the highest verbosity span lifecycles and source locations are
    /// logged too.
    pub fn from_verbosity(verbosity: u8) -> Self {
        let chatty = verbosity >= 3;
        Self {
            with_span_events: chatty,
            with_file_and_line: chatty,
            ..Self::new(verbosity_to_level(verbosity))
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Map the `verbosity` option (0..=3, higher is chattier) to a level.
pub fn verbosity_to_level(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialize tracing with custom configuration
///
/// This function is idempotent - if tracing is already initialized, it will
/// return Ok(()) without error. This makes it safe to call from every device
/// constructor and from tests.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            // Handle "already initialized" gracefully - expected when several
            // devices are created in one process
            if e
                .to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

/// Create the span a session keeps for its whole lifetime.
pub fn device_span(driver: &'static str, endpoint: &str) -> Span {
    tracing::info_span!("device", driver, endpoint = %endpoint)
}

/// Convert Level to env filter string
fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_output_format() {
        assert_eq!("pretty".parse(), Ok(OutputFormat::Pretty));
        assert_eq!("compact".parse(), Ok(OutputFormat::Compact));
        assert_eq!("JSON".parse(), Ok(OutputFormat::Json));
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(verbosity_to_level(0), Level::WARN);
        assert_eq!(verbosity_to_level(1), Level::INFO);
        assert_eq!(verbosity_to_level(2), Level::DEBUG);
        assert_eq!(verbosity_to_level(3), Level::TRACE);
        assert_eq!(verbosity_to_level(9), Level::TRACE);
    }

    #[test]
    fn test_tracing_config_builder() {
        let config = TracingConfig::from_verbosity(2)
            .with_format(OutputFormat::Json)
            .with_ansi(false);

        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(!config.with_span_events);
        assert!(!config.with_ansi);
    }

    #[test]
    fn highest_verbosity_adds_span_events() {
        let config = TracingConfig::from_verbosity(3);
        assert_eq!(config.level, Level::TRACE);
        assert!(config.with_span_events);
        assert!(config.with_file_and_line);
        assert!(!TracingConfig::from_verbosity(1).with_file_and_line);
    }
}
