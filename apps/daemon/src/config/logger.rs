use serde::Deserialize;
use tracing::metadata::Level;

/// The `[logger]` section.
#[derive(Deserialize, Default)]
pub struct LoggerConfig {
    #[serde(default)]
    pub level: LogLevel,
}

/// Verbosity, lowest to highest.
#[derive(Deserialize, Default, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}
