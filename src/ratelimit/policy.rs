//! Rate limit policies and their resolution.
//!
//! A [`PolicySet`] is built once from configuration and never changes. Token
//! requests resolve to the token's override if one exists, otherwise to the
//! default token policy. Requests without a token use the IP policy.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::{PolicyConfig, RateLimitingConfig};
use crate::error::{Result, TurnstileError};

/// An immutable limit applied to one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Requests allowed per window
    pub limit: u64,
    /// Length of the counting window
    pub window: Duration,
    /// How long the key is blocked after exceeding the limit
    pub block_duration: Duration,
}

impl Policy {
    /// Create a policy, rejecting a zero limit, window or block duration.
    pub fn new(limit: u64, window: Duration, block_duration: Duration) -> Result<Self> {
        Self::checked(limit, window, block_duration).map_err(|e| TurnstileError::Config(e.into()))
    }

    fn from_config(name: &str, window: Duration, config: &PolicyConfig) -> Result<Self> {
        Self::checked(config.limit, window, config.block_duration)
            .map_err(|e| TurnstileError::Config(format!("{}: {}", name, e)))
    }

    fn checked(
        limit: u64,
        window: Duration,
        block_duration: Duration,
    ) -> std::result::Result<Self, &'static str> {
        if limit == 0 {
            return Err("limit must be positive");
        }
        if window.is_zero() {
            return Err("window must be greater than zero");
        }
        if block_duration.is_zero() {
            return Err("block_duration must be greater than zero");
        }
        Ok(Self {
            limit,
            window,
            block_duration,
        })
    }
}

/// All policies a limiter can apply.
#[derive(Debug, Clone)]
pub struct PolicySet {
    ip: Policy,
    default_token: Policy,
    tokens: HashMap<String, Policy>,
}

impl PolicySet {
    /// Create a policy set with no per-token overrides.
    pub fn new(ip: Policy, default_token: Policy) -> Self {
        Self {
            ip,
            default_token,
            tokens: HashMap::new(),
        }
    }

    /// Add an override for one token value.
    pub fn with_token(mut self, token: impl Into<String>, policy: Policy) -> Self {
        self.tokens.insert(token.into(), policy);
        self
    }

    /// Build the policy set from configuration, validating every entry.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let window = config.window;
        let mut set = Self::new(
            Policy::from_config("ip", window, &config.ip)?,
            Policy::from_config("token", window, &config.token)?,
        );
        for (token, policy) in &config.tokens {
            if token.is_empty() {
                return Err(TurnstileError::Config("token override with empty name".into()));
            }
            let policy = Policy::from_config(&format!("tokens.{}", token), window, policy)?;
            set.tokens.insert(token.clone(), policy);
        }
        Ok(set)
    }

    /// The policy for requests identified by address.
    pub fn ip(&self) -> &Policy {
        &self.ip
    }

    /// The policy for tokens without an override.
    pub fn default_token(&self) -> &Policy {
        &self.default_token
    }

    /// Resolve the policy for a token: its override, else the default.
    pub fn for_token(&self, token: &str) -> &Policy {
        self.tokens.get(token).unwrap_or(&self.default_token)
    }

    /// Whether `token` has its own override.
    pub fn has_override(&self, token: &str) -> bool {
        self.tokens.contains_key(token)
    }
}
