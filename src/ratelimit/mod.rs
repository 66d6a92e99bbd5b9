//! Rate limiting decisions.

mod identity;
mod limiter;
mod quota;

pub use identity::Identity;
pub use limiter::{Decision, Denial, RateLimiter};
pub use quota::{
    LimiterConfig, Quota, ENV_IP_BLOCK_MINUTES, ENV_IP_REQUESTS_PER_SECOND, ENV_TOKEN_BLOCK_MINUTES,
    ENV_TOKEN_REQUESTS_PER_SECOND, WINDOW,
};
