//! Application configuration loaded from environment variables.
//!
//! All configuration is loaded from environment variables with defaults
//! suitable for development. In production, configure via environment
//! variables or a `.env` file.
//!
//! # Counter Store
//!
//! - `STORE_BACKEND`: `redis` (default) or `memory` (single process only)
//! - `REDIS_URL`: required for the `redis` backend, e.g. `redis://localhost:6379`
//! - `STORE_TIMEOUT_MS`: per-command timeout (default: 500)
//!
//! # Quotas
//!
//! Quotas are written `tokens/window_secs`; `none` disables a role:
//!
//! - `RATE_LIMIT_AUTHENTICATED` (default: `5000/3600`)
//! - `RATE_LIMIT_ANONYMOUS` (default: `60/3600`)
//! - `RATE_LIMIT_FAIL_OPEN`: let requests through when the store fails
//!   (default: false)
//!
//! # Security
//!
//! - `API_KEYS`: comma-separated `name:key` pairs; empty means every caller
//!   is anonymous
//! - `TRUSTED_PROXIES`: CIDR ranges allowed to set `X-Forwarded-For`
//! - `CORS_ALLOWED_ORIGINS`: comma-separated origins (default: `*`)

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::middleware::{ApiCredential, StoreFailurePolicy};
use crate::ratelimit::{DEFAULT_KEY_PREFIX, Quota, RateLimitPolicy, RedisSettings};

/// Which [`CounterStore`](crate::ratelimit::CounterStore) backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(format!("expected 'redis' or 'memory', got '{other}'")),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Redis => "redis",
            Self::Memory => "memory",
        })
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    // =========================================================================
    // Counter Store Configuration
    // =========================================================================
    pub store_backend: StoreBackend,

    /// Redis connection URL. Required when `store_backend` is `Redis`.
    pub redis_url: Option<String>,

    /// Prefix for every counter key (default: "ratelimit:")
    pub key_prefix: String,

    /// Upper bound for a single store round trip (default: 500ms)
    pub store_timeout: Duration,

    /// Connection attempts at startup before giving up (default: 5)
    pub store_connect_attempts: u32,

    /// Base delay between connection attempts (exponential backoff applies)
    pub store_retry_base_delay: Duration,

    /// Maximum delay between connection attempts
    pub store_retry_max_delay: Duration,

    /// Interval for the background store health probe (default: 30s)
    pub health_check_interval: Duration,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Let requests through when the store fails instead of answering 503/504
    pub fail_open: bool,

    /// Default quota for callers with a valid API key
    pub authenticated_quota: Option<Quota>,

    /// Default quota for everyone else
    pub anonymous_quota: Option<Quota>,

    /// Maximum request body size in bytes (default: 1 MiB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Known API keys. Empty disables authentication.
    pub api_keys: Vec<ApiCredential>,

    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    /// Trusted proxy CIDR ranges for IP spoofing mitigation.
    /// X-Forwarded-For headers will only be trusted if the connection
    /// originates from one of these networks.
    ///
    /// Default: Empty (forwarded headers ignored, the peer address is used)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value fails to parse or the
    /// combination is inconsistent (e.g. `redis` backend without `REDIS_URL`).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(&|name| env::var(name).ok())
    }

    /// Build and validate a configuration from a variable lookup.
    ///
    /// Unset variables take the production defaults, which differ from
    /// [`Config::default`] in the store backend (`redis`).
    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> AppResult<Self> {
        let defaults = Self::default();
        let config = Self {
            // Server
            host: lookup("HOST").unwrap_or(defaults.host),
            port: Self::parse_env(lookup, "PORT", defaults.port)?,

            // Counter store
            store_backend: Self::parse_env(lookup, "STORE_BACKEND", StoreBackend::default())?,
            redis_url: lookup("REDIS_URL").filter(|u| !u.trim().is_empty()),
            key_prefix: lookup("RATE_LIMIT_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            store_timeout: Duration::from_millis(Self::parse_env(lookup, "STORE_TIMEOUT_MS", 500)?),
            store_connect_attempts: Self::parse_env(
                lookup,
                "STORE_CONNECT_ATTEMPTS",
                defaults.store_connect_attempts,
            )?,
            store_retry_base_delay: Duration::from_millis(Self::parse_env(
                lookup,
                "STORE_RETRY_BASE_DELAY_MS",
                200,
            )?),
            store_retry_max_delay: Duration::from_millis(Self::parse_env(
                lookup,
                "STORE_RETRY_MAX_DELAY_MS",
                5000,
            )?),
            health_check_interval: Duration::from_secs(Self::parse_env(
                lookup,
                "HEALTH_CHECK_INTERVAL_SECS",
                30,
            )?),

            // Rate limiting
            fail_open: Self::parse_bool_env(lookup, "RATE_LIMIT_FAIL_OPEN", defaults.fail_open)?,
            authenticated_quota: Self::parse_quota_env(
                lookup,
                "RATE_LIMIT_AUTHENTICATED",
                defaults.authenticated_quota,
            )?,
            anonymous_quota: Self::parse_quota_env(
                lookup,
                "RATE_LIMIT_ANONYMOUS",
                defaults.anonymous_quota,
            )?,
            max_request_body_size: Self::parse_env(
                lookup,
                "MAX_REQUEST_BODY_SIZE",
                defaults.max_request_body_size,
            )?,

            // Security
            api_keys: Self::parse_api_keys(&lookup("API_KEYS").unwrap_or_default())?,
            cors_allowed_origins: Self::parse_list(
                &lookup("CORS_ALLOWED_ORIGINS").unwrap_or_else(|| "*".to_string()),
            ),
            trusted_proxies: Self::parse_list(&lookup("TRUSTED_PROXIES").unwrap_or_default()),

            // Observability
            metrics_port: Self::parse_env(lookup, "METRICS_PORT", defaults.metrics_port)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.store_backend == StoreBackend::Redis && self.redis_url.is_none() {
            return Err(AppError::ConfigError(
                "REDIS_URL is required when STORE_BACKEND is 'redis'".to_string(),
            ));
        }

        if self.store_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "STORE_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.store_retry_base_delay > self.store_retry_max_delay {
            return Err(AppError::ConfigError(format!(
                "STORE_RETRY_BASE_DELAY_MS ({:?}) must be <= STORE_RETRY_MAX_DELAY_MS ({:?})",
                self.store_retry_base_delay, self.store_retry_max_delay
            )));
        }

        if self.health_check_interval.is_zero() {
            return Err(AppError::ConfigError(
                "HEALTH_CHECK_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.default_policy().is_empty() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_AUTHENTICATED and RATE_LIMIT_ANONYMOUS cannot both be 'none'"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if API key authentication is enabled.
    pub fn auth_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// The quota pair from `RATE_LIMIT_AUTHENTICATED` / `RATE_LIMIT_ANONYMOUS`.
    pub fn default_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::new(self.authenticated_quota, self.anonymous_quota)
    }

    pub fn store_failure_policy(&self) -> StoreFailurePolicy {
        if self.fail_open {
            StoreFailurePolicy::Allow
        } else {
            StoreFailurePolicy::Reject
        }
    }

    /// Redis connection settings, if a URL is configured.
    pub fn redis_settings(&self) -> Option<RedisSettings> {
        self.redis_url.as_ref().map(|url| RedisSettings {
            operation_timeout: self.store_timeout,
            connect_attempts: self.store_connect_attempts,
            retry_base_delay: self.store_retry_base_delay,
            retry_max_delay: self.store_retry_max_delay,
            ..RedisSettings::new(url.clone())
        })
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(lookup: &dyn Fn(&str) -> Option<String>, name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match lookup(name) {
            Some(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            None => Ok(default),
        }
    }

    fn parse_bool_env(
        lookup: &dyn Fn(&str) -> Option<String>,
        name: &str,
        default: bool,
    ) -> AppResult<bool> {
        match lookup(name) {
            Some(val) => crate::validators::parse_bool(&val).ok_or_else(|| {
                AppError::ConfigError(format!("Invalid {name}: expected a boolean, got '{val}'"))
            }),
            None => Ok(default),
        }
    }

    fn parse_quota_env(
        lookup: &dyn Fn(&str) -> Option<String>,
        name: &str,
        default: Option<Quota>,
    ) -> AppResult<Option<Quota>> {
        match lookup(name) {
            Some(val) => Self::parse_quota(&val)
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            None => Ok(default),
        }
    }

    /// `tokens/window_secs`, or `none` for no quota.
    fn parse_quota(value: &str) -> Result<Option<Quota>, crate::ratelimit::QuotaError> {
        if value.trim().eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        value.parse().map(Some)
    }

    /// Parse `name:key` pairs separated by commas.
    fn parse_api_keys(value: &str) -> AppResult<Vec<ApiCredential>> {
        Self::parse_list(value)
            .iter()
            .map(|pair| match pair.split_once(':') {
                Some((user, key)) if !user.trim().is_empty() && !key.trim().is_empty() => {
                    Ok(ApiCredential::new(user.trim(), key.trim()))
                }
                _ => Err(AppError::ConfigError(
                    "Invalid API_KEYS: entries must be 'name:key'".to_string(),
                )),
            })
            .collect()
    }

    fn parse_list(value: &str) -> Vec<String> {
        value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Default configuration for testing and development.
///
/// Uses the in-memory store so tests need no Redis. `Config::from_env()`
/// defaults to the `redis` backend instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            // Counter store
            store_backend: StoreBackend::Memory,
            redis_url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_timeout: Duration::from_millis(500),
            store_connect_attempts: 5,
            store_retry_base_delay: Duration::from_millis(200),
            store_retry_max_delay: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            // Rate limiting
            fail_open: false,
            authenticated_quota: Quota::new(5000, 3600).ok(),
            anonymous_quota: Quota::new(60, 3600).ok(),
            max_request_body_size: 1024 * 1024, // 1 MiB
            // Security
            api_keys: vec![],
            cors_allowed_origins: vec!["*".to_string()],
            trusted_proxies: vec![], // Empty = use the peer address
            // Observability
            metrics_port: 9090,
        }
    }
}
