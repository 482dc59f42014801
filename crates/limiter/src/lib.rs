//! 限流原语与入站限流适配器

pub mod adapters;
pub mod bandwidth;
pub mod concurrent;
pub mod conn;
pub mod factory;
pub mod rps;
pub mod time_window;

pub use bandwidth::{BandwidthLimit, BandwidthLimiter, ServerBandwidthLimiter, STATS_PHASES};
pub use concurrent::ConcurrentLimiter;
pub use conn::ConnLimiter;
pub use factory::{
    factory_from_config, IndependentLimiter, IndependentLimiterFactory, RpsLimiterFactory,
    TimeWindowLimiterFactory,
};
pub use rps::RpsLimiter;
pub use time_window::TimeWindowLimiter;
