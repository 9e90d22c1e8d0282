//! Storage backends holding per-key request records and block state.
//!
//! Every backend implements [`StorageBackend`] and must be observationally
//! identical to callers: the in-process [`MemoryBackend`] and the shared
//! [`RedisBackend`] differ only in whether state is shared across instances.

mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::StorageConfig;
use crate::error::Result;

pub use memory::{MemoryBackend, SweepStats};
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// The limit that was applied.
    pub limit: u64,
    /// Requests left in the current window, never more than `limit`.
    pub remaining: u64,
    /// How long to wait before retrying. Zero when allowed.
    pub retry_after: Duration,
    /// Time until the current window frees a slot.
    pub reset_after: Duration,
}

impl Verdict {
    /// An admitted request.
    pub fn allowed(limit: u64, remaining: u64, reset_after: Duration) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: remaining.min(limit),
            retry_after: Duration::ZERO,
            reset_after,
        }
    }

    /// A rejected request; the key stays rejected for `retry_after`.
    pub fn rejected(limit: u64, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            retry_after,
            reset_after: retry_after,
        }
    }
}

/// Capability interface shared by every storage backend.
///
/// Keys are opaque, already-namespaced identity strings.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Atomically check the key against `limit` within `window` and record the
    /// request if admitted. Overflowing the limit blocks the key for
    /// `block_duration` and starts it over with an empty window.
    async fn check_and_consume(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        block_duration: Duration,
    ) -> Result<Verdict>;

    /// Whether the key is blocked, and for how much longer.
    async fn is_blocked(&self, key: &str) -> Result<Option<Duration>>;

    /// Block the key for `duration`, overwriting any existing block.
    async fn block(&self, key: &str, duration: Duration) -> Result<()>;

    /// Liveness probe of the backend.
    async fn health_check(&self) -> Result<()>;

    /// Release backend resources. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// Which backend a deployment asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Memory,
    Redis,
}

impl StorageMode {
    /// Parse a mode name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(StorageMode::Memory),
            "redis" => Some(StorageMode::Redis),
            _ => None,
        }
    }
}

/// Build the backend named by the configuration.
///
/// Never fails: an unknown mode or an unreachable shared store degrades to the
/// in-process backend with a warning. Cross-instance sharing is lost in that
/// case, but the admission contract is unchanged.
pub async fn connect(config: &StorageConfig) -> Arc<dyn StorageBackend> {
    match StorageMode::parse(&config.mode) {
        Some(StorageMode::Memory) => {
            info!("Using in-process storage backend");
            Arc::new(MemoryBackend::new(config.sweep_interval, config.retention))
        }
        Some(StorageMode::Redis) => connect_redis(config).await,
        None => {
            warn!(
                mode = %config.mode,
                "Unsupported storage mode, falling back to in-process storage"
            );
            Arc::new(MemoryBackend::new(config.sweep_interval, config.retention))
        }
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(config: &StorageConfig) -> Arc<dyn StorageBackend> {
    match RedisBackend::connect(config).await {
        Ok(backend) => {
            info!("Using Redis storage backend");
            Arc::new(backend)
        }
        Err(e) => {
            warn!(
                error = %e,
                "Failed to connect to Redis, falling back to in-process storage"
            );
            Arc::new(MemoryBackend::new(config.sweep_interval, config.retention))
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(config: &StorageConfig) -> Arc<dyn StorageBackend> {
    warn!("Built without the redis feature, falling back to in-process storage");
    Arc::new(MemoryBackend::new(config.sweep_interval, config.retention))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_mode_parse() {
        assert_eq!(StorageMode::parse("memory"), Some(StorageMode::Memory));
        assert_eq!(StorageMode::parse(" Redis "), Some(StorageMode::Redis));
        assert_eq!(StorageMode::parse("etcd"), None);
    }

    #[test]
    fn test_verdict_remaining_capped_at_limit() {
        let verdict = Verdict::allowed(3, 7, Duration::from_secs(1));
        assert_eq!(verdict.remaining, 3);

        let verdict = Verdict::rejected(3, Duration::from_millis(100));
        assert!(!verdict.allowed);
        assert_eq!(verdict.remaining, 0);
        assert_eq!(verdict.retry_after, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_unknown_mode_degrades_to_memory() {
        let config = StorageConfig {
            mode: "etcd".to_string(),
            ..StorageConfig::default()
        };
        let backend = connect(&config).await;
        assert!(backend.health_check().await.is_ok());
        let verdict = backend
            .check_and_consume("ip:127.0.0.1", 1, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(verdict.allowed);
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_redis_degrades_to_memory() {
        let config = StorageConfig {
            mode: "redis".to_string(),
            // Reserved port, nothing listens there.
            redis_url: "redis://127.0.0.1:1/0".to_string(),
            connect_timeout: Duration::from_millis(500),
            ..StorageConfig::default()
        };
        let backend = connect(&config).await;
        assert!(backend.health_check().await.is_ok());
        backend.close().await.unwrap();
    }
}
