//! Log level and format handling for the `[logging]` configuration section.

use crate::config::LoggingConfig;
use crate::error::{ControllerError, Result};
use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Validated logging settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Text,
        }
    }
}

impl LogConfig {
    pub fn parse_level(s: &str) -> Option<Level> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Level::TRACE),
            "debug" => Some(Level::DEBUG),
            "info" => Some(Level::INFO),
            "warn" | "warning" => Some(Level::WARN),
            "error" => Some(Level::ERROR),
            _ => None,
        }
    }

    pub fn from_config(config: &LoggingConfig) -> Result<Self> {
        let level = Self::parse_level(&config.level).ok_or_else(|| {
            ControllerError::Config(format!("unknown log level '{}'", config.level))
        })?;
        let format = LogFormat::parse(&config.format).ok_or_else(|| {
            ControllerError::Config(format!("unknown log format '{}'", config.format))
        })?;
        Ok(Self { level, format })
    }

    /// Install the global subscriber. `RUST_LOG` directives take precedence
    /// over the configured level.
    pub fn init(&self) {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(self.level).into())
            .from_env_lossy();
        let builder = tracing_subscriber::fmt()
            .with_target(false)
            .with_level(true)
            .with_env_filter(filter);
        match self.format {
            LogFormat::Text => builder.init(),
            LogFormat::Json => builder.json().init(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(LogFormat::parse("text"), Some(LogFormat::Text));
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn test_from_config() {
        let config = LogConfig::from_config(&LoggingConfig {
            level: "warning".into(),
            format: "json".into(),
        })
        .unwrap();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Json);

        assert!(LogConfig::from_config(&LoggingConfig {
            level: "loud".into(),
            format: "text".into(),
        })
        .is_err());
    }
}
