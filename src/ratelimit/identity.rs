//! Identity key generation and handling.

use std::net::IpAddr;

use crate::error::{Result, TurnstileError};

/// A key that uniquely identifies the subject of a rate limit.
///
/// Addresses and tokens live in separate namespaces, so a token whose value
/// happens to look like an address never shares state with that address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    /// A client network address
    Ip(IpAddr),
    /// An opaque access token
    Token(String),
}

impl IdentityKey {
    /// Build an address identity, failing if `address` does not parse.
    pub fn ip(address: &str) -> Result<Self> {
        address
            .trim()
            .parse::<IpAddr>()
            .map(IdentityKey::Ip)
            .map_err(|_| TurnstileError::InvalidIdentity(format!("invalid address: {:?}", address)))
    }

    /// Build a token identity, failing if `token` is empty.
    pub fn token(token: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TurnstileError::InvalidIdentity("empty token".to_string()));
        }
        Ok(IdentityKey::Token(token.to_string()))
    }

    /// Convert the identity to the namespaced storage key.
    pub fn to_storage_key(&self) -> String {
        match self {
            IdentityKey::Ip(addr) => format!("ip:{}", addr),
            IdentityKey::Token(token) => format!("token:{}", token),
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityKey::Ip(addr) => write!(f, "ip:{}", addr),
            // Tokens are credentials of a sort; keep them out of logs.
            IdentityKey::Token(token) => {
                let visible: String = token.chars().take(4).collect();
                write!(f, "token:{}…", visible)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_identity() {
        let key = IdentityKey::ip("192.168.1.1").unwrap();
        assert_eq!(key.to_storage_key(), "ip:192.168.1.1");

        let key = IdentityKey::ip("::1").unwrap();
        assert_eq!(key.to_storage_key(), "ip:::1");
    }

    #[test]
    fn test_invalid_ip_rejected() {
        for address in ["", "not-an-ip", "1.2.3.4:80", "300.1.1.1"] {
            let err = IdentityKey::ip(address).unwrap_err();
            assert!(matches!(err, TurnstileError::InvalidIdentity(_)), "{}", address);
        }
    }

    #[test]
    fn test_empty_token_rejected() {
        assert!(matches!(
            IdentityKey::token(""),
            Err(TurnstileError::InvalidIdentity(_))
        ));
        assert!(IdentityKey::token("   ").is_err());
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let ip = IdentityKey::ip("1.2.3.4").unwrap();
        let token = IdentityKey::token("1.2.3.4").unwrap();

        assert_ne!(ip, token);
        assert_ne!(ip.to_storage_key(), token.to_storage_key());
        assert_eq!(token.to_storage_key(), "token:1.2.3.4");
    }

    #[test]
    fn test_display_masks_token() {
        let token = IdentityKey::token("abcdef123456").unwrap();
        assert_eq!(token.to_string(), "token:abcd…");
    }
}
