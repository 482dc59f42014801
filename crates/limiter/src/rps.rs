use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::factory::IndependentLimiter;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

/// 令牌桶请求限流器，令牌数允许为小数
///
/// 任意时间段 `Δt` 内放行次数不超过 `burst + rps·Δt`。
#[derive(Debug)]
pub struct RpsLimiter {
    rps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl RpsLimiter {
    /// 初始时令牌桶是满的
    pub fn new(rps: f64, burst: f64) -> Self {
        Self {
            rps,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst.max(0.0),
                last: Instant::now(),
            }),
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        if self.rps <= 0.0 || self.burst <= 0.0 {
            return false;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        // 时钟回退时按零间隔处理
        let elapsed = now
            .checked_duration_since(state.last)
            .unwrap_or(Duration::ZERO);
        let tokens = (state.tokens + elapsed.as_secs_f64() * self.rps).min(self.burst) - 1.0;
        if tokens < 0.0 {
            return false;
        }
        state.tokens = tokens;
        state.last = now.max(state.last);
        true
    }
}

impl IndependentLimiter for RpsLimiter {
    fn allow(&self) -> bool {
        RpsLimiter::allow(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_parameters_reject() {
        assert!(!RpsLimiter::new(0.0, 5.0).allow());
        assert!(!RpsLimiter::new(5.0, 0.0).allow());
        assert!(!RpsLimiter::new(-1.0, 5.0).allow());
    }

    #[test]
    fn test_burst_then_refill() {
        let limiter = RpsLimiter::new(2.0, 3.0);
        let start = Instant::now();
        let admitted = (0..10).filter(|_| limiter.allow_at(start)).count();
        assert_eq!(admitted, 3);

        // 0.5 秒补充一个令牌
        assert!(limiter.allow_at(start + Duration::from_millis(500)));
        assert!(!limiter.allow_at(start + Duration::from_millis(600)));
    }

    #[test]
    fn test_admissions_bounded_by_burst_plus_rate() {
        let rps = 10.0;
        let burst = 4.0;
        let limiter = RpsLimiter::new(rps, burst);
        let start = Instant::now();
        let mut admitted = 0;
        for step in 0..=300u64 {
            let now = start + Duration::from_millis(step * 3);
            if limiter.allow_at(now) {
                admitted += 1;
            }
        }
        let elapsed = Duration::from_millis(900).as_secs_f64();
        assert!(admitted as f64 <= burst + rps * elapsed, "admitted {admitted}");
        assert!(admitted >= 12);
    }

    #[test]
    fn test_clock_going_backwards_does_not_mint_tokens() {
        let limiter = RpsLimiter::new(1.0, 1.0);
        let start = Instant::now() + Duration::from_secs(10);
        assert!(limiter.allow_at(start));
        assert!(!limiter.allow_at(start - Duration::from_secs(5)));
        assert!(!limiter.allow_at(start));
    }
}
