//! Rate limiting policy and identity resolution.

mod identity;
mod limiter;
mod policy;

pub use identity::IdentityKey;
pub use limiter::RateLimiter;
pub use policy::{Policy, PolicySet};
