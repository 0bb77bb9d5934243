use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use super::{server_bind_address, site_origins, DEFAULT_DATABASE_URL, DEFAULT_SITE_DOMAIN};

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

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Fixed-window limit applied per client address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub site_domain: String,
    pub cors_origins: Vec<String>,
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let site_domain =
            env::var("APP_SITE_DOMAIN").unwrap_or_else(|_| DEFAULT_SITE_DOMAIN.to_string());

        let mut cors_origins = site_origins(&site_domain);
        if let Ok(extra) = env::var("APP_CORS_EXTRA_ORIGINS") {
            cors_origins.extend(
                extra
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string),
            );
        }

        let defaults = RateLimitConfig::default();
        let max_requests =
            parse_number::<u32>("APP_RATE_LIMIT_MAX")?.unwrap_or(defaults.max_requests);
        let window = parse_number::<u64>("APP_RATE_LIMIT_WINDOW_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.window);
        if max_requests == 0 || window.is_zero() {
            return Err(ConfigError::InvalidRateLimit);
        }

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            site_domain,
            cors_origins,
            rate_limit: RateLimitConfig {
                max_requests,
                window,
            },
        })
    }
}

/// Out-of-range values are rejected rather than truncated.
fn parse_number<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { key, value: raw }),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidNumber { key: &'static str, value: String },
    InvalidRateLimit,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidNumber { key, value } => {
                write!(f, "{key} must be a non-negative integer in range (got {value})")
            }
            Self::InvalidRateLimit => write!(
                f,
                "APP_RATE_LIMIT_MAX and APP_RATE_LIMIT_WINDOW_SECS must be greater than zero"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));
