use std::{env, fmt, net::SocketAddr, time::Duration};

use chrono_tz::Tz;

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/loyalty.db?mode=rwc";
pub const DEFAULT_PROGRAM_CODE: &str = "STAFF";
pub const DEFAULT_MAIL_FROM: &str = "no-reply@loyalty.local";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    /// Code of the loyalty program every request operates on.
    pub program_code: String,
    /// Zone whose midnight starts a new accrual/eligibility day.
    pub timezone: Tz,
    pub notify: NotifyConfig,
}

/// Settings for the notification consumer and its mail relay.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub batch: u32,
    pub interval: Duration,
    pub dry_run: bool,
    pub relay_url: Option<String>,
    pub relay_token: Option<String>,
    pub mail_from: String,
}

impl NotifyConfig {
    /// Returns the relay URL, failing when delivery is live and none is configured.
    pub fn require_relay(&self) -> Result<Option<&str>, ConfigError> {
        match (&self.relay_url, self.dry_run) {
            (_, true) => Ok(None),
            (Some(url), false) => Ok(Some(url)),
            (None, false) => Err(ConfigError::MissingRelayUrl),
        }
    }
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let database_url = non_empty("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.into());
        let program_code =
            non_empty("LOYALTY_PROGRAM_CODE").unwrap_or_else(|| DEFAULT_PROGRAM_CODE.into());
        let timezone_name = non_empty("LOYALTY_TIMEZONE").unwrap_or_else(|| "UTC".into());
        let timezone = timezone_name
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(timezone_name))?;

        let batch = parse_positive("WORKER_BATCH", 20)?;
        let interval_ms = parse_positive("WORKER_INTERVAL_MS", 60_000)?;
        let dry_run = match non_empty("NOTIFY_DRY_RUN") {
            Some(value) => parse_flag(&value)
                .ok_or_else(|| ConfigError::InvalidFlag("NOTIFY_DRY_RUN", value))?,
            None => false,
        };
        let relay_url = non_empty("MAIL_RELAY_URL");
        if let Some(url) = &relay_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidRelayUrl(url.clone()));
            }
        }

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            program_code,
            timezone,
            notify: NotifyConfig {
                batch,
                interval: Duration::from_millis(u64::from(interval_ms)),
                dry_run,
                relay_url,
                relay_token: non_empty("MAIL_RELAY_TOKEN"),
                mail_from: non_empty("MAIL_FROM").unwrap_or_else(|| DEFAULT_MAIL_FROM.into()),
            },
        })
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_positive(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match non_empty(key) {
        None => Ok(default),
        Some(value) => match value.parse::<u32>() {
            Ok(parsed) if parsed > 0 => Ok(parsed),
            _ => Err(ConfigError::InvalidNumber(key, value)),
        },
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidTimezone(String),
    InvalidNumber(&'static str, String),
    InvalidFlag(&'static str, String),
    InvalidRelayUrl(String),
    MissingRelayUrl,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidTimezone(value) => {
                write!(f, "LOYALTY_TIMEZONE must be an IANA zone name (got {value})")
            }
            Self::InvalidNumber(key, value) => {
                write!(f, "{key} must be a positive integer (got {value})")
            }
            Self::InvalidFlag(key, value) => write!(f, "{key} must be true or false (got {value})"),
            Self::InvalidRelayUrl(value) => {
                write!(f, "MAIL_RELAY_URL must be an http(s) URL (got {value})")
            }
            Self::MissingRelayUrl => {
                write!(f, "MAIL_RELAY_URL is required unless NOTIFY_DRY_RUN is enabled")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tests::ENV_GUARD, DEFAULT_BIND_ADDR};

    const KEYS: [&str; 11] = [
        "APP_ENV",
        "APP_BIND_ADDR",
        "DATABASE_URL",
        "LOYALTY_PROGRAM_CODE",
        "LOYALTY_TIMEZONE",
        "WORKER_BATCH",
        "WORKER_INTERVAL_MS",
        "NOTIFY_DRY_RUN",
        "MAIL_RELAY_URL",
        "MAIL_RELAY_TOKEN",
        "MAIL_FROM",
    ];

    fn clear() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.program_code, "STAFF");
        assert_eq!(config.timezone, Tz::UTC);
        assert_eq!(config.notify.batch, 20);
        assert_eq!(config.notify.interval, Duration::from_secs(60));
        assert!(!config.notify.dry_run);
        assert!(matches!(
            config.notify.require_relay(),
            Err(ConfigError::MissingRelayUrl)
        ));
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        clear();
    }

    #[test]
    fn parses_production_settings() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("LOYALTY_TIMEZONE", "Europe/Lisbon");
        env::set_var("WORKER_BATCH", "5");
        env::set_var("NOTIFY_DRY_RUN", "yes");
        env::set_var("MAIL_RELAY_URL", "https://relay.example.com/");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.timezone, chrono_tz::Europe::Lisbon);
        assert_eq!(config.notify.batch, 5);
        assert!(config.notify.dry_run);
        assert!(matches!(config.notify.require_relay(), Ok(None)));

        clear();
    }

    #[test]
    fn rejects_malformed_values() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear();

        env::set_var("LOYALTY_TIMEZONE", "Mars/Olympus");
        assert!(matches!(
            AppConfig::from_env(),
            Err(ConfigError::InvalidTimezone(_))
        ));
        clear();

        env::set_var("WORKER_BATCH", "0");
        assert!(matches!(
            AppConfig::from_env(),
            Err(ConfigError::InvalidNumber("WORKER_BATCH", _))
        ));
        clear();

        env::set_var("NOTIFY_DRY_RUN", "maybe");
        assert!(matches!(
            AppConfig::from_env(),
            Err(ConfigError::InvalidFlag("NOTIFY_DRY_RUN", _))
        ));
        clear();

        env::set_var("MAIL_RELAY_URL", "smtp://relay");
        assert!(matches!(
            AppConfig::from_env(),
            Err(ConfigError::InvalidRelayUrl(_))
        ));
        clear();
    }
}
