use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Outbound request limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Sustained REST calls per second
    pub requests_per_second: u32,
    /// Calls allowed back to back before throttling kicks in
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1,
            burst: 3,
        }
    }
}

/// Shared limiter placed in front of every REST call
pub type OutboundLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Create a new outbound limiter; zero values are raised to one
pub fn create_rate_limiter(config: &RateLimiterConfig) -> OutboundLimiter {
    let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)))
}
