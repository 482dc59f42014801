use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 优雅关闭管理器
///
/// 关闭状态由 `CancellationToken` 记录，订阅者通过广播通道收到一次关闭信号。
#[derive(Clone)]
pub struct ShutdownManager {
    signal: broadcast::Sender<()>,
    closed: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (signal, _) = broadcast::channel(4);
        Self {
            signal,
            closed: CancellationToken::new(),
        }
    }

    /// 订阅关闭信号，已关闭时返回的接收器立即触发
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        let rx = self.signal.subscribe();
        if !self.closed.is_cancelled() {
            return rx;
        }
        let (tx, fired) = broadcast::channel(1);
        let _ = tx.send(());
        fired
    }

    /// 触发关闭，重复调用无效果
    pub fn shutdown(&self) {
        if self.closed.is_cancelled() {
            debug!("关闭管理器已经触发过关闭");
            return;
        }
        self.closed.cancel();
        debug!("发送关闭信号给 {} 个订阅者", self.signal.receiver_count());
        let _ = self.signal.send(());
        info!("关闭信号已发送");
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
