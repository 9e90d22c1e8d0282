//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::identity::IdentityKey;
use super::policy::{Policy, PolicySet};
use crate::config::RateLimitingConfig;
use crate::error::Result;
use crate::storage::{StorageBackend, Verdict};

/// The policy layer between requests and storage.
///
/// Holds no mutable state of its own: every check resolves a policy from the
/// immutable [`PolicySet`] and delegates to the injected backend. Token
/// identity always takes precedence over the caller's address.
pub struct RateLimiter {
    /// Storage holding per-key request and block state
    backend: Arc<dyn StorageBackend>,
    /// Policies fixed at construction time
    policies: PolicySet,
}

impl RateLimiter {
    /// Create a new rate limiter over the given backend.
    pub fn new(backend: Arc<dyn StorageBackend>, policies: PolicySet) -> Self {
        Self { backend, policies }
    }

    /// Create a rate limiter from configuration, validating every policy.
    pub fn from_config(backend: Arc<dyn StorageBackend>, config: &RateLimitingConfig) -> Result<Self> {
        Ok(Self::new(backend, PolicySet::from_config(config)?))
    }

    /// Check a request identified only by its network address.
    pub async fn check_ip(&self, address: &str) -> Result<Verdict> {
        let identity = IdentityKey::ip(address)?;
        self.check_identity(&identity, self.policies.ip()).await
    }

    /// Check a request identified by an access token.
    pub async fn check_token(&self, token: &str) -> Result<Verdict> {
        let identity = IdentityKey::token(token)?;
        let policy = self.policies.for_token(token.trim());
        self.check_identity(&identity, policy).await
    }

    /// Check a request carrying an address and possibly a token.
    ///
    /// A non-empty token is checked on its own; the address is not consulted,
    /// even if it is currently blocked.
    pub async fn check(&self, address: &str, token: &str) -> Result<Verdict> {
        if token.trim().is_empty() {
            self.check_ip(address).await
        } else {
            self.check_token(token).await
        }
    }

    async fn check_identity(&self, identity: &IdentityKey, policy: &Policy) -> Result<Verdict> {
        trace!(
            identity = %identity,
            limit = policy.limit,
            window = ?policy.window,
            "Checking rate limit"
        );

        let verdict = self
            .backend
            .check_and_consume(
                &identity.to_storage_key(),
                policy.limit,
                policy.window,
                policy.block_duration,
            )
            .await?;

        if !verdict.allowed {
            debug!(
                identity = %identity,
                retry_after = ?verdict.retry_after,
                "Rate limit exceeded"
            );
        }
        Ok(verdict)
    }

    /// Block an identity for `duration` regardless of its window state.
    pub async fn block(&self, identity: &IdentityKey, duration: Duration) -> Result<()> {
        self.backend.block(&identity.to_storage_key(), duration).await
    }

    /// Remaining block time for an identity, if it is blocked.
    pub async fn is_blocked(&self, identity: &IdentityKey) -> Result<Option<Duration>> {
        self.backend.is_blocked(&identity.to_storage_key()).await
    }

    /// Probe the storage backend.
    pub async fn health_check(&self) -> Result<()> {
        self.backend.health_check().await
    }

    /// Release the storage backend.
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }

    /// The policies this limiter was built with.
    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    /// The window length of the address policy.
    pub fn window(&self) -> Duration {
        self.policies.ip().window
    }
}
