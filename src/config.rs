use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::invalidation::InvalidationTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deployment {
    Local,
    Dev,
    Stage,
    Prod,
}

impl Deployment {
    #[must_use]
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Self::Dev,
            "stage" | "staging" => Self::Stage,
            "prod" | "production" => Self::Prod,
            _ => Self::Local,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Origin API
    pub origin_base_url: String,
    pub origin_timeout_seconds: u64,

    // API settings
    pub api_host: String,
    pub api_port: u16,

    // Rate limiting (per client IP, proxied reads only)
    pub disable_rate_limiting: bool,
    /// Sustained requests per second once the burst is spent
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,

    // Caching
    pub cache_fresh_ttl_seconds: u64,
    pub cache_stale_ttl_seconds: u64,
    pub cache_max_bytes: u64,

    // Freshness domains bumped by the refresh trigger
    pub invalidation_table: InvalidationTable,

    // Application metadata
    pub deployment: Deployment,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin_base_url: "http://localhost:6080".to_string(),
            origin_timeout_seconds: 10,
            api_host: "0.0.0.0".to_string(),
            api_port: 3000,
            disable_rate_limiting: false,
            rate_limit_per_second: 10,
            rate_limit_burst: 60,
            cache_fresh_ttl_seconds: 60,
            cache_stale_ttl_seconds: 120,
            cache_max_bytes: 209_715_200, // 200MB
            invalidation_table: InvalidationTable::default(),
            deployment: Deployment::Local,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparseable numeric values fall back to [`Config::default`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if `REFRESH_INVALIDATION_TABLE` is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let invalidation_table = match env::var("REFRESH_INVALIDATION_TABLE") {
            Ok(raw) => InvalidationTable::parse(&raw).map_err(|reason| ConfigError::Invalid {
                name: "REFRESH_INVALIDATION_TABLE",
                reason,
            })?,
            Err(_) => defaults.invalidation_table,
        };

        Ok(Self {
            // Origin API
            origin_base_url: env::var("ORIGIN_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.origin_base_url),
            origin_timeout_seconds: parse_var("ORIGIN_TIMEOUT_SECONDS", defaults.origin_timeout_seconds),

            // API settings
            api_host: env::var("API_HOST").unwrap_or(defaults.api_host),
            api_port: parse_var("API_PORT", defaults.api_port),

            // Rate limiting
            disable_rate_limiting: parse_var("DISABLE_RATE_LIMITING", defaults.disable_rate_limiting),
            rate_limit_per_second: parse_var("RATE_LIMIT_PER_SECOND", defaults.rate_limit_per_second),
            rate_limit_burst: parse_var("RATE_LIMIT_BURST", defaults.rate_limit_burst),

            // Caching
            cache_fresh_ttl_seconds: parse_var("CACHE_FRESH_TTL_SECONDS", defaults.cache_fresh_ttl_seconds),
            cache_stale_ttl_seconds: parse_var("CACHE_STALE_TTL_SECONDS", defaults.cache_stale_ttl_seconds),
            cache_max_bytes: parse_var("CACHE_MAX_BYTES", defaults.cache_max_bytes),

            invalidation_table,

            // Application metadata
            deployment: Deployment::from_str(
                &env::var("DEPLOYMENT").unwrap_or_else(|_| "local".to_string()),
            ),
        })
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    #[must_use]
    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout_seconds)
    }
}

/// Read an environment variable and parse it, falling back to `default`
/// when it is unset or does not parse.
pub(crate) fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
