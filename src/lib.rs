//! Turnstile - Per-Key Request Admission Control
//!
//! This crate decides, per client identity, whether an inbound request may
//! proceed. Identities are network addresses or access tokens; each is held
//! to a sliding-window limit and blocked for a while after exceeding it.
//! State lives either in process or in a shared Redis store so that several
//! service instances enforce one combined limit.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod storage;
