//! HTTP surface: the rate limiting interceptor and the routes behind it.

mod interceptor;
mod routes;
mod server;

pub use interceptor::{
    rate_limit_middleware, ClientIdentity, RateLimitState, API_KEY_HEADER, FALLBACK_CLIENT_IP,
    FORWARDED_FOR_HEADER, REAL_IP_HEADER, REJECTION_MESSAGE, REMAINING_HEADER,
};
pub use routes::router;
pub use server::HttpServer;
