//! Log subscriber setup for applications embedding the webphone
//!
//! The crate itself only emits `tracing` events. Hosts that do not install
//! their own subscriber can call [`setup_logging`], optionally deriving the
//! filter from the configured [`DebugLevel`].

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::client::config::DebugLevel;
use crate::error::{WebphoneError, WebphoneResult};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level for everything not matched by `directive`
    pub level: Level,
    /// Extra filter directive, e.g. `webphone_core=debug`
    pub directive: Option<String>,
    /// Whether to include file and line information
    pub file_info: bool,
    /// Whether to log span enter/exit
    pub log_spans: bool,
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::WARN,
            directive: None,
            file_info: false,
            log_spans: false,
            app_name: "webphone".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Filter the crate's own output according to the debug option
    pub fn from_debug(debug: &DebugLevel) -> Self {
        LoggingConfig {
            directive: Some(debug.log_filter().to_string()),
            ..Default::default()
        }
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    /// Filter built from `RUST_LOG`, the default level and the directive
    pub fn env_filter(&self) -> WebphoneResult<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level.into());
        if let Some(directive) = &self.directive {
            let directive = directive
                .parse()
                .map_err(|e| {
                    WebphoneError::invalid_configuration("log directive", format!("{}", e))
                })?;
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    }
}

/// Install a global fmt subscriber. Fails if one is already installed.
pub fn setup_logging(config: LoggingConfig) -> WebphoneResult<()> {
    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    fmt::Subscriber::builder()
        .with_env_filter(config.env_filter()?)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .try_init()
        .map_err(|e| WebphoneError::invalid_configuration("logging", e.to_string()))?;

    tracing::info!("Starting {} v{}", config.app_name, crate::VERSION);
    Ok(())
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> WebphoneResult<Level> {
    Level::from_str(level).map_err(|_| {
        WebphoneError::invalid_configuration("log level", format!("Invalid log level: {}", level))
    })
}
