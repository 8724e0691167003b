use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::order::ServiceSettings;
use crate::utils::RetryConfig;

// ============================================================================
// Application Configuration
// ============================================================================
//
// Read once at startup from the environment. Unset variables take their
// defaults; set-but-unparsable ones are an error rather than silently ignored.
//
// ============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// PostgreSQL backend when set, in-memory otherwise
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub settlement_delay: Duration,
    /// `None` disables the metrics server
    pub metrics_port: Option<u16>,
    pub conflict_retry_attempts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 5,
            settlement_delay: Duration::from_millis(5000),
            metrics_port: Some(9090),
            conflict_retry_attempts: 3,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = vars
            .get("DATABASE_URL")
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        let database_max_connections = parse_or(
            &vars,
            "DATABASE_MAX_CONNECTIONS",
            defaults.database_max_connections,
        )?;

        let settlement_delay_ms: u64 = parse_or(
            &vars,
            "SETTLEMENT_DELAY_MS",
            defaults.settlement_delay.as_millis() as u64,
        )?;

        let metrics_port: u16 = parse_or(&vars, "METRICS_PORT", 9090)?;

        let conflict_retry_attempts = parse_or(
            &vars,
            "CONFLICT_RETRY_ATTEMPTS",
            defaults.conflict_retry_attempts,
        )?;

        Ok(Self {
            database_url,
            database_max_connections,
            settlement_delay: Duration::from_millis(settlement_delay_ms),
            metrics_port: (metrics_port != 0).then_some(metrics_port),
            conflict_retry_attempts,
        })
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            settlement_delay: self.settlement_delay,
            conflict_retry: RetryConfig::conflict(self.conflict_retry_attempts),
        }
    }
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name).map(|v| v.trim()) {
        None | Some("") => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidNumber {
            name,
            value: raw.to_string(),
        }),
    }
}
