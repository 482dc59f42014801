//! 带宽限流
//!
//! 统计周期被切分为 [`STATS_PHASES`] 个桶，后台定时器每 `period / STATS_PHASES`
//! 轮转一次并清空最旧的桶，窗口内累计流量加上本次大小超过上限即拒绝。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use edgefleet_core::{FleetError, FleetResult};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const STATS_PHASES: usize = 10;
const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

/// 按连接计量的带宽限流接口
pub trait BandwidthLimit: Send + Sync {
    fn allow(&self, conn: &str, size: u64) -> bool;
}

#[derive(Debug, Default, Clone)]
struct Window {
    buckets: [u64; STATS_PHASES],
    current: usize,
}

impl Window {
    fn sum(&self) -> u64 {
        self.buckets.iter().fold(0u64, |acc, b| acc.saturating_add(*b))
    }

    fn add(&mut self, size: u64) {
        self.buckets[self.current] = self.buckets[self.current].saturating_add(size);
    }

    fn rotate(&mut self) {
        self.current = (self.current + 1) % STATS_PHASES;
        self.buckets[self.current] = 0;
    }
}

fn normalize_period(period: Duration) -> Duration {
    if period < Duration::from_millis(STATS_PHASES as u64) {
        DEFAULT_PERIOD
    } else {
        period
    }
}

fn spawn_rotation<F>(period: Duration, stop: CancellationToken, mut rotate: F)
where
    F: FnMut() + Send + 'static,
{
    let phase = period / STATS_PHASES as u32;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(phase);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => rotate(),
            }
        }
        debug!("带宽统计轮转任务已停止");
    });
}

/// 客户端带宽限流器，不区分连接
///
/// 创建时需要处于 tokio 运行时中。
#[derive(Debug)]
pub struct BandwidthLimiter {
    max_throughput: u64,
    window: Arc<Mutex<Window>>,
    stop: CancellationToken,
}

impl BandwidthLimiter {
    pub fn new(max_throughput: u64, period: Duration) -> Self {
        let window = Arc::new(Mutex::new(Window::default()));
        let stop = CancellationToken::new();
        let rotating = window.clone();
        spawn_rotation(normalize_period(period), stop.clone(), move || {
            rotating.lock().unwrap_or_else(PoisonError::into_inner).rotate();
        });
        Self {
            max_throughput,
            window,
            stop,
        }
    }

    pub fn allow(&self, size: u64) -> bool {
        if self.max_throughput == 0 {
            return false;
        }
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if window.sum().saturating_add(size) > self.max_throughput {
            return false;
        }
        window.add(size);
        true
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl BandwidthLimit for BandwidthLimiter {
    fn allow(&self, _conn: &str, size: u64) -> bool {
        BandwidthLimiter::allow(self, size)
    }
}

impl Drop for BandwidthLimiter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[derive(Debug, Default)]
struct ServerState {
    total: Window,
    conns: HashMap<String, Window>,
}

/// 服务端带宽限流器，额外记录每个已注册连接的流量
///
/// `reserve_rate` 为 0 表示不预留；取值在 (0,1] 时，总容量的 `reserve_rate` 部分
/// 平均预留给已注册连接，剩余部分由所有连接竞争。
#[derive(Debug)]
pub struct ServerBandwidthLimiter {
    max_throughput: u64,
    reserve_rate: f64,
    state: Arc<Mutex<ServerState>>,
    stop: CancellationToken,
}

impl ServerBandwidthLimiter {
    pub fn new(max_throughput: u64, period: Duration, reserve_rate: f64) -> FleetResult<Self> {
        if !(0.0..=1.0).contains(&reserve_rate) {
            return Err(FleetError::Validation(format!(
                "带宽预留比例必须在 [0, 1] 区间内: {reserve_rate}"
            )));
        }
        let state = Arc::new(Mutex::new(ServerState::default()));
        let stop = CancellationToken::new();
        let rotating = state.clone();
        spawn_rotation(normalize_period(period), stop.clone(), move || {
            let mut state = rotating.lock().unwrap_or_else(PoisonError::into_inner);
            state.total.rotate();
            for window in state.conns.values_mut() {
                window.rotate();
            }
        });
        Ok(Self {
            max_throughput,
            reserve_rate,
            state,
            stop,
        })
    }

    pub fn register_conn(&self, conn: &str) {
        let mut state = self.lock();
        state.conns.entry(conn.to_string()).or_default();
    }

    pub fn unregister_conn(&self, conn: &str) {
        self.lock().conns.remove(conn);
    }

    pub fn registered(&self) -> usize {
        self.lock().conns.len()
    }

    pub fn allow(&self, conn: &str, size: u64) -> bool {
        if self.max_throughput == 0 {
            return false;
        }
        let mut state = self.lock();
        if state.total.sum().saturating_add(size) > self.max_throughput {
            return false;
        }
        let Some(usage) = state.conns.get(conn).map(Window::sum) else {
            return false;
        };

        if self.reserve_rate > 0.0 {
            let max = self.max_throughput as f64;
            let share = self.reserve_rate * max / state.conns.len() as f64;
            let after = usage.saturating_add(size) as f64;
            if after > share {
                // 超出预留份额的部分计入共享池
                let shareable = max * (1.0 - self.reserve_rate);
                let shared_used: f64 = state
                    .conns
                    .values()
                    .map(|w| (w.sum() as f64 - share).max(0.0))
                    .sum();
                let extra = (after - share) - (usage as f64 - share).max(0.0);
                if shared_used + extra > shareable {
                    return false;
                }
            }
        }

        state.total.add(size);
        if let Some(window) = state.conns.get_mut(conn) {
            window.add(size);
        }
        true
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BandwidthLimit for ServerBandwidthLimiter {
    fn allow(&self, conn: &str, size: u64) -> bool {
        ServerBandwidthLimiter::allow(self, conn, size)
    }
}

impl Drop for ServerBandwidthLimiter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
