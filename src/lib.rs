//! Ratekeeper - Request Rate Limiting Service
//!
//! This crate decides per request whether to allow or reject it, counting
//! against the client IP or, when one is presented, an access token. Counts
//! live in a fixed one-second window; exceeding the quota blocks the
//! identity for a configured number of minutes. State is kept in process
//! memory or shared through Redis.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod storage;
