//! Application Configuration Module
//!
//! Loads the service settings from the environment (and a `.env` file when
//! present) into one struct built at startup.

use secrecy::SecretString;
use sightline_core::Mode;
use sightline_core::mode::ParseModeError;
use std::env;
use std::path::PathBuf;
use tracing::Level;

/// Holds all configuration loaded from the environment.
#[derive(Debug)]
pub struct Config {
    pub gemini_api_key: SecretString,
    pub model: String,
    pub voice: String,
    pub mode: Mode,
    pub safety: bool,
    /// Directory of persona prompt overrides.
    pub prompts_dir: Option<PathBuf>,
    pub log_level: Level,
}

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
    #[error("Invalid SIGHTLINE_MODE: {0}")]
    InvalidMode(#[from] ParseModeError),
    #[error("Invalid boolean for {var}: {value:?}")]
    InvalidFlag { var: String, value: String },
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `GEMINI_API_KEY`: Secret key for the Gemini Live API. Required.
    // *   `GEMINI_MODEL`: (Optional) Live model name. Defaults to `models/gemini-2.0-flash-exp`.
    // *   `SIGHTLINE_VOICE`: (Optional) Prebuilt voice. Defaults to "Puck".
    // *   `SIGHTLINE_MODE`: (Optional) navigation, reading or object. Defaults to navigation.
    // *   `SIGHTLINE_SAFETY`: (Optional) true or false. Defaults to false.
    // *   `SIGHTLINE_PROMPTS`: (Optional) Directory of prompt override files.
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Ignored when there is no .env file.
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let gemini_api_key = lookup("GEMINI_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;

        let model = lookup("GEMINI_MODEL").unwrap_or_else(|| gemini_live::config::DEFAULT_MODEL.to_string());
        let voice = lookup("SIGHTLINE_VOICE").unwrap_or_else(|| "Puck".to_string());

        let mode = match lookup("SIGHTLINE_MODE") {
            Some(value) => value.parse()?,
            None => Mode::Navigation,
        };

        let safety = match lookup("SIGHTLINE_SAFETY") {
            Some(value) => parse_flag("SIGHTLINE_SAFETY", &value)?,
            None => false,
        };

        let prompts_dir = lookup("SIGHTLINE_PROMPTS").map(PathBuf::from);

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            gemini_api_key,
            model,
            voice,
            mode,
            safety,
            prompts_dir,
            log_level,
        })
    }
}

fn parse_flag(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}
