//! Ratewarden - Distributed Rate Limiter
//!
//! This crate lets many independent service instances enforce a shared,
//! per-key call quota. Each process answers most checks from a local
//! reservation and only consults the shared Redis counter when that
//! reservation runs out, leasing a whole bucket of quota per round-trip.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{RateLimitError, Result};
pub use ratelimit::{Admission, FailurePolicy, RateLimitConfig, RateLimiter};
