pub mod backoff;
pub mod cancel;
pub mod rate_limiter;

pub use backoff::RetryPolicy;
pub use cancel::CancelToken;
pub use rate_limiter::RateLimiter;
