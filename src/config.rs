use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use thiserror::Error;
use tracing::Level;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db_url: String,
    pub working_dirpath: PathBuf,
    pub status_interval_secs: u64,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// One of TRACE, DEBUG, INFO, WARN, ERROR.
    pub level: String,
    /// Directory of the daily rotated log file; no file logging when unset.
    pub dirpath: Option<PathBuf>,
    /// Also print log messages on the console.
    pub verbose: bool,
    /// Forces DEBUG level.
    pub debug: bool,
}

impl LoggingConfig {
    pub fn effective_level(&self) -> Level {
        if self.debug {
            return Level::DEBUG;
        }
        self.level.parse().unwrap_or(Level::WARN)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate the status interval and the log level.
    fn validate(&self) -> Result<(), ConfigError> {
        const MIN_INTERVAL: u64 = 1;
        const MAX_INTERVAL: u64 = 3600;

        if !(MIN_INTERVAL..=MAX_INTERVAL).contains(&self.status_interval_secs) {
            return Err(ConfigError::ParsingError(format!(
                "STATUS_INTERVAL_SECS must be between {} and {} seconds",
                MIN_INTERVAL, MAX_INTERVAL
            )));
        }
        if self.logging.level.parse::<Level>().is_err() {
            return Err(ConfigError::ParsingError(format!(
                "LOG_LEVEL '{}' is not a log level",
                self.logging.level
            )));
        }
        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingOrInvalid(key.to_string()))
        };
        let flag = |key: &str| -> Result<bool, ConfigError> {
            match lookup(key).as_deref().map(str::trim) {
                None | Some("") => Ok(false),
                Some("1") | Some("true") | Some("TRUE") | Some("yes") => Ok(true),
                Some("0") | Some("false") | Some("FALSE") | Some("no") => Ok(false),
                Some(other) => Err(ConfigError::ParsingError(format!(
                    "{} must be a boolean, got '{}'",
                    key, other
                ))),
            }
        };

        let config = Self {
            db_url: required("DB_URL")?,
            working_dirpath: PathBuf::from(required("WORKING_DIRPATH")?),
            status_interval_secs: lookup("STATUS_INTERVAL_SECS")
                .unwrap_or_else(|| "30".to_string())
                .parse::<u64>()
                .map_err(|_| {
                    ConfigError::ParsingError(
                        "STATUS_INTERVAL_SECS must be a valid number".to_string(),
                    )
                })?,
            logging: LoggingConfig {
                level: lookup("LOG_LEVEL").unwrap_or_else(|| "WARN".to_string()),
                dirpath: lookup("LOG_DIRPATH").filter(|v| !v.is_empty()).map(PathBuf::from),
                verbose: flag("LOG_VERBOSE")?,
                debug: flag("LOG_DEBUG")?,
            },
        };

        config.validate()?;

        Ok(config)
    }
}
