pub mod client;
pub mod rate_limit;

pub use client::ApiClient;
pub use rate_limit::{LimitSpec, RateLimitLedger, UsageCounter};
