//! Rate limiting logic and local admission state.

mod cache;
mod limiter;
mod policy;
mod rules;

pub use cache::LocalAdmissionCache;
pub use limiter::{Admission, RateLimiter};
pub use policy::FailurePolicy;
pub use rules::{LimitTable, RateLimitConfig, ValidatedLimit, MAX_WINDOW};
