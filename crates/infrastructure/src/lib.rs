pub mod cache;
pub mod dns;
pub mod hosts;
pub mod metrics;
pub mod resolvconf;

pub use cache::{CacheKey, ResponseCache};
pub use metrics::Metrics;
