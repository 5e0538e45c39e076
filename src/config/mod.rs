//! Configuration for audix-hub.
//!
//! Everything comes from the environment; the two secrets are hard
//! requirements and the server refuses to boot without them.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 5005;

/// Runtime configuration, resolved once at boot.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port for the combined HTTP + WebSocket server.
    pub port: u16,

    /// HMAC key for session cookie signatures.
    pub session_secret: String,

    /// Shared secret for `/api/internal/live-snapshot`.
    pub live_token: String,

    /// Postgres connection string.
    pub database_url: String,

    /// Production mode; gates the cookie `Secure` attribute.
    pub production: bool,

    /// Directory the static pages are served from.
    pub web_root: PathBuf,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingVar(&'static str),
    InvalidPort(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingVar(name) => {
                write!(f, "required environment variable {} is not set", name)
            }
            ConfigError::InvalidPort(value) => write!(f, "invalid PORT value: {}", value),
        }
    }
}

impl Error for ConfigError {}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match std::env::var("PORT") {
            Ok(raw) => parse_port(&raw)?,
            Err(_) => DEFAULT_PORT,
        };

        Ok(Self {
            port,
            session_secret: require_var("SESSION_SECRET")?,
            live_token: require_var("AUDIX_LIVE_TOKEN")?,
            database_url: require_var("DATABASE_URL")?,
            production: std::env::var("AUDIX_ENV")
                .map(|v| v == "production")
                .unwrap_or(false),
            web_root: std::env::var("AUDIX_WEB_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("web")),
        })
    }
}

fn require_var(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    raw.trim()
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidPort(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_accepts_plain_numbers() {
        assert_eq!(parse_port("5005").unwrap(), 5005);
        assert_eq!(parse_port(" 8080 ").unwrap(), 8080);
    }

    #[test]
    fn parse_port_rejects_garbage() {
        assert!(parse_port("").is_err());
        assert!(parse_port("http").is_err());
        assert!(parse_port("70000").is_err());
    }
}
