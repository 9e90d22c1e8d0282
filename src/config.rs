//! Configuration management for Turnstile.
//!
//! Configuration is assembled once at startup: defaults, then an optional
//! YAML file, then process environment variables. The result is validated
//! and treated as an immutable snapshot for the lifetime of the process.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, TurnstileError};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage backend configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rate limiting policy configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Deadline applied to each admission check
    #[serde(default = "default_request_timeout", with = "duration")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            request_timeout: default_request_timeout(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend mode name (`memory` or `redis`)
    #[serde(default = "default_storage_mode")]
    pub mode: String,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Optional namespace prepended to every Redis key
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Deadline for establishing the Redis connection
    #[serde(default = "default_connect_timeout", with = "duration")]
    pub connect_timeout: Duration,

    /// Deadline for a single Redis operation
    #[serde(default = "default_operation_timeout", with = "duration")]
    pub operation_timeout: Duration,

    /// How often the in-process backend sweeps idle state
    #[serde(default = "default_sweep_interval", with = "duration")]
    pub sweep_interval: Duration,

    /// Request records older than this are dropped by the sweep
    #[serde(default = "default_retention", with = "duration")]
    pub retention: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: default_storage_mode(),
            redis_url: default_redis_url(),
            key_prefix: None,
            connect_timeout: default_connect_timeout(),
            operation_timeout: default_operation_timeout(),
            sweep_interval: default_sweep_interval(),
            retention: default_retention(),
        }
    }
}

fn default_storage_mode() -> String {
    "redis".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_operation_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_retention() -> Duration {
    Duration::from_secs(600)
}

/// Limit and block duration for one class of identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Requests allowed per window
    pub limit: u64,
    /// How long a key stays blocked after exceeding the limit
    #[serde(default = "default_block_duration", with = "duration")]
    pub block_duration: Duration,
}

fn default_block_duration() -> Duration {
    Duration::from_secs(300)
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Length of the counting window
    #[serde(default = "default_window", with = "duration")]
    pub window: Duration,

    /// Policy applied to requests without a token
    #[serde(default = "default_ip_policy")]
    pub ip: PolicyConfig,

    /// Policy applied to tokens without an override
    #[serde(default = "default_token_policy")]
    pub token: PolicyConfig,

    /// Per-token overrides, keyed by the token value
    #[serde(default)]
    pub tokens: HashMap<String, PolicyConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            ip: default_ip_policy(),
            token: default_token_policy(),
            tokens: HashMap::new(),
        }
    }
}

fn default_window() -> Duration {
    Duration::from_secs(1)
}

fn default_ip_policy() -> PolicyConfig {
    PolicyConfig {
        limit: 10,
        block_duration: default_block_duration(),
    }
}

fn default_token_policy() -> PolicyConfig {
    PolicyConfig {
        limit: 100,
        block_duration: default_block_duration(),
    }
}

impl TurnstileConfig {
    /// Load the full configuration: `.env`, optional file, environment, validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!(path = %env_file.display(), "Loaded .env file");
        }

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;

        info!(
            mode = %config.storage.mode,
            window = ?config.rate_limiting.window,
            ip_limit = config.rate_limiting.ip.limit,
            token_limit = config.rate_limiting.token.limit,
            token_overrides = config.rate_limiting.tokens.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration file");

        let contents = std::fs::read_to_string(path).map_err(|e| {
            TurnstileError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Overlay environment variables on top of the current values.
    ///
    /// Takes the variables as an iterator so callers (and tests) decide the
    /// source. Malformed values are errors, never silently defaulted.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let get = |name: &str| vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(port) = get("PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| TurnstileError::Config(format!("PORT is not a valid port: {}", port)))?;
            self.server.http_addr.set_port(port);
        }
        if let Some(timeout) = get("REQUEST_TIMEOUT") {
            self.server.request_timeout = parse_env_duration("REQUEST_TIMEOUT", timeout)?;
        }

        if let Some(mode) = get("STORAGE_TYPE") {
            self.storage.mode = mode.to_string();
        }
        let redis_addr = get("REDIS_ADDR");
        let redis_password = get("REDIS_PASSWORD");
        let redis_db = get("REDIS_DB");
        if redis_addr.is_some() || redis_password.is_some() || redis_db.is_some() {
            let db: u32 = match redis_db {
                Some(db) => db.parse().map_err(|_| {
                    TurnstileError::Config(format!("REDIS_DB is not a valid database index: {}", db))
                })?,
                None => 0,
            };
            let addr = redis_addr.unwrap_or("127.0.0.1:6379");
            self.storage.redis_url = match redis_password {
                Some(password) => format!("redis://:{}@{}/{}", password, addr, db),
                None => format!("redis://{}/{}", addr, db),
            };
        }

        let limits = &mut self.rate_limiting;
        if let Some(window) = get("WINDOW") {
            limits.window = parse_env_duration("WINDOW", window)?;
        }
        if let Some(limit) = get("IP_RATE_LIMIT") {
            limits.ip.limit = parse_env_limit("IP_RATE_LIMIT", limit)?;
        }
        if let Some(block) = get("IP_BLOCK_DURATION") {
            limits.ip.block_duration = parse_env_duration("IP_BLOCK_DURATION", block)?;
        }
        if let Some(limit) = get("TOKEN_RATE_LIMIT") {
            limits.token.limit = parse_env_limit("TOKEN_RATE_LIMIT", limit)?;
        }
        if let Some(block) = get("TOKEN_BLOCK_DURATION") {
            limits.token.block_duration = parse_env_duration("TOKEN_BLOCK_DURATION", block)?;
        }

        // TOKEN_<NAME>_RATE_LIMIT / TOKEN_<NAME>_BLOCK_DURATION
        for (name, value) in &vars {
            let Some(token) = name
                .strip_prefix("TOKEN_")
                .and_then(|rest| rest.strip_suffix("_RATE_LIMIT"))
            else {
                continue;
            };
            let limit = parse_env_limit(name, value.trim())?;
            let block_var = format!("TOKEN_{}_BLOCK_DURATION", token);
            let block_duration = match get(&block_var) {
                Some(block) => parse_env_duration(&block_var, block)?,
                None => limits.token.block_duration,
            };
            debug!(token = %token.to_lowercase(), limit, "Token override from environment");
            limits.tokens.insert(
                token.to_lowercase(),
                PolicyConfig {
                    limit,
                    block_duration,
                },
            );
        }

        Ok(())
    }

    /// Reject configurations that can never produce a meaningful verdict.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.rate_limiting;
        if limits.window.is_zero() {
            return Err(TurnstileError::Config("window must be greater than zero".into()));
        }
        validate_policy("ip", &limits.ip)?;
        validate_policy("token", &limits.token)?;
        for (name, policy) in &limits.tokens {
            if name.is_empty() {
                return Err(TurnstileError::Config("token override with empty name".into()));
            }
            validate_policy(&format!("tokens.{}", name), policy)?;
        }

        if self.server.request_timeout.is_zero() {
            return Err(TurnstileError::Config("request_timeout must be greater than zero".into()));
        }
        if self.storage.operation_timeout.is_zero() || self.storage.connect_timeout.is_zero() {
            return Err(TurnstileError::Config("storage timeouts must be greater than zero".into()));
        }
        if self.storage.sweep_interval.is_zero() {
            return Err(TurnstileError::Config("sweep_interval must be greater than zero".into()));
        }
        if self.storage.retention <= limits.window {
            return Err(TurnstileError::Config(
                "retention must be longer than the rate limit window".into(),
            ));
        }
        Ok(())
    }
}

fn validate_policy(name: &str, policy: &PolicyConfig) -> Result<()> {
    if policy.limit == 0 {
        return Err(TurnstileError::Config(format!("{}: limit must be positive", name)));
    }
    if policy.block_duration.is_zero() {
        return Err(TurnstileError::Config(format!(
            "{}: block_duration must be greater than zero",
            name
        )));
    }
    Ok(())
}

fn parse_env_limit(name: &str, value: &str) -> Result<u64> {
    let limit: i64 = value
        .parse()
        .map_err(|_| TurnstileError::Config(format!("{} is not an integer: {}", name, value)))?;
    if limit <= 0 {
        return Err(TurnstileError::Config(format!("{} must be positive, got {}", name, limit)));
    }
    Ok(limit as u64)
}

fn parse_env_duration(name: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| TurnstileError::Config(format!("{}: {}", name, e)))
}

/// Parse a Go-style duration (`300ms`, `5m`, `1h30m`, `1.5s`).
///
/// A bare integer is read as whole seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let invalid = || TurnstileError::Config(format!("invalid duration: {:?}", input));

    if s.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total_nanos: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_end == 0 {
            return Err(invalid());
        }
        let number = &rest[..number_end];
        let after = &rest[number_end..];
        let unit_end = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());

        let unit_nanos: u128 = match &after[..unit_end] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return Err(invalid()),
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
        total_nanos += whole * unit_nanos;
        if !fraction.is_empty() {
            if fraction.len() > 18 {
                return Err(invalid());
            }
            let digits: u128 = fraction.parse().map_err(|_| invalid())?;
            total_nanos += digits * unit_nanos / 10u128.pow(fraction.len() as u32);
        }

        rest = &after[unit_end..];
    }

    let secs = u64::try_from(total_nanos / 1_000_000_000).map_err(|_| invalid())?;
    Ok(Duration::new(secs, (total_nanos % 1_000_000_000) as u32))
}

/// Render a duration in the form accepted by [`parse_duration`].
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else if duration.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}ns", duration.as_nanos())
    }
}

/// Serde adapter for durations written as strings or whole seconds.
pub mod duration {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration such as \"500ms\" or \"5m\", or whole seconds")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom(format!("negative duration: {}", v)))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).map_err(E::custom)
        }
    }
}
