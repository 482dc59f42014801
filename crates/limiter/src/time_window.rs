use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use crate::factory::IndependentLimiter;

/// 时间窗口限流器：每个 `expired` 周期最多放行一次
#[derive(Debug)]
pub struct TimeWindowLimiter {
    expired: Duration,
    origin: Instant,
    /// 上次放行时刻（相对 origin 的纳秒数 + 1），0 表示从未放行
    last_nanos: AtomicI64,
}

impl TimeWindowLimiter {
    pub fn new(expired: Duration) -> Self {
        Self {
            expired,
            origin: Instant::now(),
            last_nanos: AtomicI64::new(0),
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let now_nanos = now
            .checked_duration_since(self.origin)
            .map(|d| d.as_nanos().min(i64::MAX as u128 - 1) as i64)
            .unwrap_or(0)
            + 1;
        let expired = self.expired.as_nanos().min(i64::MAX as u128) as i64;

        let mut last = self.last_nanos.load(Ordering::Acquire);
        loop {
            if last != 0 && now_nanos < last.saturating_add(expired) {
                return false;
            }
            match self.last_nanos.compare_exchange(
                last,
                now_nanos,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => last = current,
            }
        }
    }
}

impl IndependentLimiter for TimeWindowLimiter {
    fn allow(&self) -> bool {
        TimeWindowLimiter::allow(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_admits_then_window_applies() {
        let limiter = TimeWindowLimiter::new(Duration::from_millis(500));
        let start = Instant::now();
        assert!(limiter.allow_at(start));
        assert!(!limiter.allow_at(start + Duration::from_millis(100)));
        assert!(!limiter.allow_at(start + Duration::from_millis(499)));
        assert!(limiter.allow_at(start + Duration::from_millis(500)));
        assert!(!limiter.allow_at(start + Duration::from_millis(700)));
    }

    #[test]
    fn test_zero_window_always_admits() {
        let limiter = TimeWindowLimiter::new(Duration::ZERO);
        assert!(limiter.allow());
        assert!(limiter.allow());
    }
}
