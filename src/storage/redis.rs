//! Redis-backed storage shared across service instances.
//!
//! Each key owns a sorted set of admitted request timestamps
//! (`rate_limit:<key>`, scored in microseconds) and, while blocked, a string
//! key with a TTL (`blocked:<key>`). The admission step runs as one Lua
//! script so block check, trim, count, insert and expiry are atomic with
//! respect to every other instance. Block expiry is handled by Redis TTLs.
//!
//! An overflowing request is never inserted into the sorted set, so rejected
//! requests cannot inflate later counts.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, trace};

use super::{StorageBackend, Verdict};
use crate::config::StorageConfig;
use crate::error::{Result, TurnstileError};

/// KEYS[1] = counter key, KEYS[2] = block key
/// ARGV[1] = limit, ARGV[2] = window (us), ARGV[3] = block duration (ms),
/// ARGV[4] = unique member for this request
///
/// Returns {allowed, remaining, retry_after_ms, reset_after_us, newly_blocked}.
const CHECK_AND_CONSUME_SCRIPT: &str = r#"
local counter_key = KEYS[1]
local block_key = KEYS[2]
local limit = tonumber(ARGV[1])
local window_us = tonumber(ARGV[2])
local block_ms = tonumber(ARGV[3])

local block_ttl = redis.call('PTTL', block_key)
if block_ttl > 0 then
  return {0, 0, block_ttl, block_ttl * 1000, 0}
end

local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000000 + tonumber(time[2])

redis.call('ZREMRANGEBYSCORE', counter_key, '-inf', now - window_us)
local count = redis.call('ZCARD', counter_key)

if count >= limit then
  redis.call('DEL', counter_key)
  redis.call('SET', block_key, '1', 'PX', block_ms)
  return {0, 0, block_ms, block_ms * 1000, 1}
end

redis.call('ZADD', counter_key, now, ARGV[4])
redis.call('PEXPIRE', counter_key, math.ceil(window_us / 1000) * 2)

local oldest = redis.call('ZRANGE', counter_key, 0, 0, 'WITHSCORES')
local reset_us = tonumber(oldest[2]) + window_us - now
return {1, limit - count - 1, 0, reset_us, 0}
"#;

/// Storage backend on a shared Redis instance.
pub struct RedisBackend {
    connection: RwLock<Option<ConnectionManager>>,
    script: Script,
    key_prefix: String,
    operation_timeout: Duration,
}

impl RedisBackend {
    /// Connect to Redis and verify the connection with a `PING`.
    ///
    /// Fails with `BackendUnavailable` if the server cannot be reached within
    /// the configured connect timeout.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| TurnstileError::Config(format!("Invalid Redis URL: {}", e)))?;

        let mut manager = tokio::time::timeout(
            config.connect_timeout,
            client.get_connection_manager(),
        )
        .await?
        .map_err(TurnstileError::unavailable)?;

        let _: String = tokio::time::timeout(
            config.connect_timeout,
            ::redis::cmd("PING").query_async(&mut manager),
        )
        .await?
        .map_err(TurnstileError::unavailable)?;

        info!(url = %redact(&config.redis_url), "Connected to Redis");

        Ok(Self {
            connection: RwLock::new(Some(manager)),
            script: Script::new(CHECK_AND_CONSUME_SCRIPT),
            key_prefix: config.key_prefix.clone().unwrap_or_default(),
            operation_timeout: config.operation_timeout,
        })
    }

    fn counter_key(&self, key: &str) -> String {
        format!("{}rate_limit:{}", self.key_prefix, key)
    }

    fn block_key(&self, key: &str) -> String {
        format!("{}blocked:{}", self.key_prefix, key)
    }

    /// Clone the shared connection handle without holding the lock across I/O.
    fn connection(&self) -> Result<ConnectionManager> {
        self.connection
            .read()
            .clone()
            .ok_or_else(|| TurnstileError::BackendUnavailable("redis backend is closed".to_string()))
    }

    /// Run a Redis future under the operation deadline.
    async fn bounded<T, F>(&self, operation: F) -> Result<T>
    where
        F: std::future::Future<Output = ::redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.operation_timeout, operation)
            .await?
            .map_err(TurnstileError::unavailable)
    }
}

/// Strip the password from a Redis URL before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// Largest duration handed to the script, in microseconds. Lua numbers are
/// doubles, so integers above 2^53 lose precision.
const MAX_SCRIPT_MICROS: u64 = 1 << 53;

/// Microseconds for the script, saturating at [`MAX_SCRIPT_MICROS`].
fn script_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros())
        .unwrap_or(u64::MAX)
        .min(MAX_SCRIPT_MICROS)
}

/// Milliseconds for a `PX` expiry: at least 1, saturating like [`script_micros`].
fn millis_at_least_one(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis())
        .unwrap_or(u64::MAX)
        .clamp(1, MAX_SCRIPT_MICROS / 1000)
}

/// `{allowed, remaining, retry_after_ms, reset_after_us, newly_blocked}`
type ScriptReply = (i64, i64, i64, i64, i64);

/// Turn the script reply into a verdict, plus whether this call set the block.
fn decode_reply(limit: u64, reply: ScriptReply) -> (Verdict, bool) {
    let (allowed, remaining, retry_after_ms, reset_after_us, newly_blocked) = reply;
    let verdict = if allowed == 1 {
        Verdict::allowed(
            limit,
            remaining.max(0) as u64,
            Duration::from_micros(reset_after_us.max(0) as u64),
        )
    } else {
        Verdict::rejected(limit, Duration::from_millis(retry_after_ms.max(0) as u64))
    };
    (verdict, newly_blocked == 1)
}

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn check_and_consume(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        block_duration: Duration,
    ) -> Result<Verdict> {
        let mut conn = self.connection()?;
        let counter_key = self.counter_key(key);
        let block_key = self.block_key(key);
        let member = uuid::Uuid::new_v4().simple().to_string();

        let reply: ScriptReply = self
            .bounded(
                self.script
                    .key(&counter_key)
                    .key(&block_key)
                    .arg(limit)
                    .arg(script_micros(window))
                    .arg(millis_at_least_one(block_duration))
                    .arg(&member)
                    .invoke_async(&mut conn),
            )
            .await?;

        let (verdict, newly_blocked) = decode_reply(limit, reply);
        trace!(
            key = %key,
            allowed = verdict.allowed,
            remaining = verdict.remaining,
            retry_after = ?verdict.retry_after,
            "Redis rate limit check"
        );
        if newly_blocked {
            debug!(key = %key, limit, "Rate limit exceeded, blocking key");
        }
        Ok(verdict)
    }

    async fn is_blocked(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection()?;
        let ttl_ms: i64 = self
            .bounded(::redis::cmd("PTTL").arg(self.block_key(key)).query_async(&mut conn))
            .await?;

        // -2: no such key, -1: no expiry set.
        if ttl_ms > 0 {
            Ok(Some(Duration::from_millis(ttl_ms as u64)))
        } else {
            Ok(None)
        }
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<()> {
        let mut conn = self.connection()?;
        let _: () = self
            .bounded(
                ::redis::cmd("SET")
                    .arg(self.block_key(key))
                    .arg("1")
                    .arg("PX")
                    .arg(millis_at_least_one(duration))
                    .query_async(&mut conn),
            )
            .await?;
        debug!(key = %key, duration = ?duration, "Key blocked");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection()?;
        let _: String = self
            .bounded(::redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.connection.write().take().is_some() {
            debug!("Redis storage backend closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_password() {
        assert_eq!(
            redact("redis://:secret@cache:6379/0"),
            "redis://***@cache:6379/0"
        );
        assert_eq!(redact("redis://cache:6379/0"), "redis://cache:6379/0");
    }

    #[test]
    fn test_block_duration_rounds_up_to_one_ms() {
        assert_eq!(millis_at_least_one(Duration::from_micros(10)), 1);
        assert_eq!(millis_at_least_one(Duration::from_millis(250)), 250);
    }

    #[test]
    fn test_decode_reply() {
        let (verdict, newly_blocked) = decode_reply(3, (1, 2, 0, 750_000, 0));
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 2);
        assert_eq!(verdict.reset_after, Duration::from_millis(750));
        assert!(!newly_blocked);

        let (verdict, newly_blocked) = decode_reply(3, (0, 0, 100, 100_000, 1));
        assert!(!verdict.allowed);
        assert_eq!(verdict.retry_after, Duration::from_millis(100));
        assert!(newly_blocked);
    }

    #[test]
    fn test_existing_block_is_not_reported_as_new() {
        // Remaining block time equal to the full block length.
        let (verdict, newly_blocked) = decode_reply(3, (0, 0, 100, 100_000, 0));
        assert!(!verdict.allowed);
        assert_eq!(verdict.retry_after, Duration::from_millis(100));
        assert!(!newly_blocked);
    }

    #[test]
    fn test_huge_durations_saturate() {
        let huge = Duration::from_secs(u64::MAX);
        assert_eq!(script_micros(huge), MAX_SCRIPT_MICROS);
        assert_eq!(millis_at_least_one(huge), MAX_SCRIPT_MICROS / 1000);

        // u64::MAX ms plus one second would wrap to 999 under a plain cast.
        let wrapping = Duration::from_millis(u64::MAX) + Duration::from_secs(1);
        assert_eq!(millis_at_least_one(wrapping), MAX_SCRIPT_MICROS / 1000);
        assert_eq!(script_micros(Duration::from_secs(1)), 1_000_000);
    }

    #[tokio::test]
    async fn test_connect_unreachable_is_unavailable() {
        let config = StorageConfig {
            redis_url: "redis://127.0.0.1:1/0".to_string(),
            connect_timeout: Duration::from_millis(500),
            ..StorageConfig::default()
        };
        let err = RedisBackend::connect(&config).await.err().unwrap();
        assert!(err.is_backend_unavailable());
    }

    #[tokio::test]
    async fn test_connect_invalid_url_is_config_error() {
        let config = StorageConfig {
            redis_url: "not a url".to_string(),
            ..StorageConfig::default()
        };
        let err = RedisBackend::connect(&config).await.err().unwrap();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    fn live_config() -> StorageConfig {
        StorageConfig {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string()),
            key_prefix: Some(format!("turnstile-test-{}:", uuid::Uuid::new_v4().simple())),
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_live_scenario() {
        let store = RedisBackend::connect(&live_config()).await.unwrap();
        let window = Duration::from_secs(1);
        let block = Duration::from_millis(100);

        for expected in [2, 1, 0] {
            let verdict = store.check_and_consume("k", 3, window, block).await.unwrap();
            assert!(verdict.allowed);
            assert_eq!(verdict.remaining, expected);
        }

        let verdict = store.check_and_consume("k", 3, window, block).await.unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.retry_after <= block);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let verdict = store.check_and_consume("k", 3, window, block).await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 2);

        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(store.health_check().await.unwrap_err().is_backend_unavailable());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_live_explicit_block() {
        let store = RedisBackend::connect(&live_config()).await.unwrap();

        assert_eq!(store.is_blocked("k").await.unwrap(), None);
        store.block("k", Duration::from_secs(5)).await.unwrap();
        let remaining = store.is_blocked("k").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(5));

        let verdict = store
            .check_and_consume("k", 100, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!verdict.allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_live_concurrent_checks_never_exceed_limit() {
        let store = std::sync::Arc::new(RedisBackend::connect(&live_config()).await.unwrap());
        let limit = 25;

        let tasks = (0..10).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                let mut admitted = 0u64;
                for _ in 0..10 {
                    let verdict = store
                        .check_and_consume("shared", limit, Duration::from_secs(30), Duration::from_secs(30))
                        .await
                        .unwrap();
                    admitted += verdict.allowed as u64;
                }
                admitted
            })
        });

        let admitted: u64 = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .sum();
        assert_eq!(admitted, limit);
    }
}
