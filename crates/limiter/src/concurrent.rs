use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 令牌默认归还时间
pub const DEFAULT_OVERDUE: Duration = Duration::from_secs(5);

/// 全局并发限流器
///
/// 放行时非阻塞地取走一个令牌，令牌在 `overdue` 到期或调用方取消时归还，以先到者为准。
#[derive(Debug, Clone)]
pub struct ConcurrentLimiter {
    tokens: Arc<Semaphore>,
    overdue: Duration,
}

impl ConcurrentLimiter {
    pub fn new(concurrency: usize) -> Self {
        Self::with_overdue(concurrency, DEFAULT_OVERDUE)
    }

    /// `overdue` 为零时使用默认值
    pub fn with_overdue(concurrency: usize, overdue: Duration) -> Self {
        Self {
            tokens: Arc::new(Semaphore::new(concurrency)),
            overdue: if overdue.is_zero() { DEFAULT_OVERDUE } else { overdue },
        }
    }

    pub fn allow(&self, cancel: &CancellationToken) -> bool {
        let Ok(permit) = self.tokens.clone().try_acquire_owned() else {
            return false;
        };
        let cancel = cancel.clone();
        let overdue = self.overdue;
        let tokens = self.tokens.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(overdue) => {}
                _ = cancel.cancelled() => {}
            }
            drop(permit);
            debug!("归还并发令牌，当前可用: {}", tokens.available_permits());
        });
        true
    }

    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }
}
