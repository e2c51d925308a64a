//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::game::{GameRules, MAX_ROUNDS, NEXT_ROUND_DELAY_SECONDS, ROUND_TIMER_SECONDS};
use crate::util::rate_limit::MESSAGE_RATE_LIMIT;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS, comma-separated; `*` allows any
    pub client_origin: String,

    /// Round timing and length applied to new sessions
    pub rules: GameRules,
    /// Inbound messages allowed per connection per second
    pub max_messages_per_second: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Render-style PORT wins over SERVER_ADDR
        let server_addr = match lookup("PORT") {
            Some(port) => format!("0.0.0.0:{}", port),
            None => lookup("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        };

        let max_rounds: u32 = parse_or(&lookup, "MAX_ROUNDS", MAX_ROUNDS)?;
        if max_rounds == 0 {
            return Err(ConfigError::Invalid("MAX_ROUNDS"));
        }

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            client_origin: lookup("CLIENT_ORIGIN").unwrap_or_else(|| "*".to_string()),

            rules: GameRules {
                round_timer: Duration::from_secs(parse_or(
                    &lookup,
                    "ROUND_TIMER_SECONDS",
                    ROUND_TIMER_SECONDS,
                )?),
                next_round_delay: Duration::from_secs(parse_or(
                    &lookup,
                    "NEXT_ROUND_DELAY_SECONDS",
                    NEXT_ROUND_DELAY_SECONDS,
                )?),
                max_rounds,
            },
            max_messages_per_second: parse_or(
                &lookup,
                "MAX_MESSAGES_PER_SECOND",
                MESSAGE_RATE_LIMIT,
            )?,
        })
    }

    /// Origins listed in `client_origin`, or `None` when any origin is allowed
    pub fn allowed_origins(&self) -> Option<Vec<String>> {
        if self.client_origin.trim() == "*" {
            return None;
        }
        Some(
            self.client_origin
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        )
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
