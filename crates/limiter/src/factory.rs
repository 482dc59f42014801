use std::time::Duration;

use edgefleet_core::config::{IpLimiterVersion, LimitHandlerConfig};
use edgefleet_core::FleetResult;

use crate::rps::RpsLimiter;
use crate::time_window::TimeWindowLimiter;

/// 单实例限流器，每个客户端 IP 一个
pub trait IndependentLimiter: Send + Sync {
    fn allow(&self) -> bool;
}

pub trait IndependentLimiterFactory: Send + Sync {
    fn create(&self) -> Box<dyn IndependentLimiter>;
}

/// 由 "N/M"（M 秒 N 次）构建时间窗口限流器，窗口为 `M·1s / N`
#[derive(Debug, Clone)]
pub struct TimeWindowLimiterFactory {
    expired: Duration,
}

impl TimeWindowLimiterFactory {
    pub fn new(count: u32, seconds: u32) -> Self {
        let expired = if count == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(seconds as u64) / count
        };
        Self { expired }
    }

    pub fn expired(&self) -> Duration {
        self.expired
    }
}

impl IndependentLimiterFactory for TimeWindowLimiterFactory {
    fn create(&self) -> Box<dyn IndependentLimiter> {
        Box::new(TimeWindowLimiter::new(self.expired))
    }
}

/// 由 "N/M" 与突发容量构建令牌桶限流器，速率为 N/M 次每秒
#[derive(Debug, Clone)]
pub struct RpsLimiterFactory {
    rate: f64,
    burst: f64,
}

impl RpsLimiterFactory {
    pub fn new(count: u32, seconds: u32, burst: u32) -> Self {
        let rate = if seconds == 0 {
            0.0
        } else {
            count as f64 / seconds as f64
        };
        Self {
            rate,
            burst: burst as f64,
        }
    }
}

impl IndependentLimiterFactory for RpsLimiterFactory {
    fn create(&self) -> Box<dyn IndependentLimiter> {
        Box::new(RpsLimiter::new(self.rate, self.burst))
    }
}

/// 按配置的版本选择单IP限流器工厂
pub fn factory_from_config(
    config: &LimitHandlerConfig,
) -> FleetResult<Box<dyn IndependentLimiterFactory>> {
    let (count, seconds) = config.parse_ip_concurrency()?;
    Ok(match config.version {
        IpLimiterVersion::V2 => Box::new(TimeWindowLimiterFactory::new(count, seconds)),
        IpLimiterVersion::V3 => Box::new(RpsLimiterFactory::new(count, seconds, config.ip_burst)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window_from_ratio() {
        assert_eq!(
            TimeWindowLimiterFactory::new(2, 1).expired(),
            Duration::from_millis(500)
        );
        assert_eq!(
            TimeWindowLimiterFactory::new(1, 3).expired(),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_each_created_limiter_is_independent() {
        let factory = TimeWindowLimiterFactory::new(1, 60);
        let a = factory.create();
        let b = factory.create();
        assert!(a.allow());
        assert!(!a.allow());
        assert!(b.allow());
    }

    #[test]
    fn test_v3_factory_allows_burst() {
        let config = LimitHandlerConfig {
            ip_concurrency: "1/10".to_string(),
            ip_burst: 3,
            version: IpLimiterVersion::V3,
            ..Default::default()
        };
        let limiter = factory_from_config(&config).unwrap().create();
        assert_eq!((0..5).filter(|_| limiter.allow()).count(), 3);
    }
}
