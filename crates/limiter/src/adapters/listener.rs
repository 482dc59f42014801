//! 限流 TCP 监听器
//!
//! 在 accept 阶段同时限制全局连接数与单IP连接数，超限的连接以 linger 0 直接关闭。

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use edgefleet_core::config::{ListenerConfig, DEFAULT_CACHE_SIZE};
use lru::LruCache;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy)]
struct IpEntry {
    count: usize,
    touched_at: Instant,
}

/// 单IP连接计数
///
/// 超过 TTL 未活动的空闲记录被清理；记录数达到容量时只淘汰空闲记录，仍有连接的IP从不淘汰。
#[derive(Debug)]
struct IpConnCounter {
    limit: usize,
    ttl: Duration,
    entries: Mutex<LruCache<IpAddr, IpEntry>>,
}

impl IpConnCounter {
    fn new(limit: usize, cache_size: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(cache_size)
            .or_else(|| NonZeroUsize::new(DEFAULT_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            limit,
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn try_add(&self, ip: IpAddr) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        self.prune_expired(&mut entries, now);

        if let Some(entry) = entries.get_mut(&ip) {
            if entry.count >= self.limit {
                return false;
            }
            entry.count += 1;
            entry.touched_at = now;
            return true;
        }
        if self.limit == 0 {
            return false;
        }
        if entries.len() >= entries.cap().get() {
            let idle = entries
                .iter()
                .rev()
                .find(|(_, entry)| entry.count == 0)
                .map(|(ip, _)| *ip);
            match idle {
                Some(victim) => {
                    entries.pop(&victim);
                }
                None => {
                    warn!("单IP连接记录已满且均有活动连接，拒绝新的IP: {}", ip);
                    return false;
                }
            }
        }
        entries.put(
            ip,
            IpEntry {
                count: 1,
                touched_at: now,
            },
        );
        true
    }

    /// 每次访问都会提升记录，从最久未访问的一端开始清理过期的空闲记录
    fn prune_expired(&self, entries: &mut LruCache<IpAddr, IpEntry>, now: Instant) {
        let expired: Vec<IpAddr> = entries
            .iter()
            .rev()
            .take_while(|(_, entry)| now.duration_since(entry.touched_at) > self.ttl)
            .filter(|(_, entry)| entry.count == 0)
            .map(|(ip, _)| *ip)
            .collect();
        for ip in expired {
            entries.pop(&ip);
        }
    }

    fn done(&self, ip: IpAddr) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&ip) {
            entry.count = entry.count.saturating_sub(1);
            entry.touched_at = Instant::now();
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn current(&self, ip: &IpAddr) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.peek(ip).map(|e| e.count).unwrap_or(0)
    }
}

/// 带限流的 TCP 监听器，可直接交给 `axum::serve`
pub struct LimitListener {
    inner: TcpListener,
    permits: Arc<Semaphore>,
    ip_counter: Arc<IpConnCounter>,
}

impl LimitListener {
    pub fn new(inner: TcpListener, config: &ListenerConfig) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(config.concurrency)),
            ip_counter: Arc::new(IpConnCounter::new(
                config.ip_conn_limit,
                config.cache_size,
                Duration::from_secs(config.ttl_seconds),
            )),
        }
    }

    pub async fn bind(addr: &str, config: &ListenerConfig) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self::new(inner, config))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn ip_conn_count(&self, ip: &IpAddr) -> usize {
        self.ip_counter.current(ip)
    }

    /// 接收下一个通过限流的连接，超限连接被关闭后继续等待
    pub async fn accept_limited(&mut self) -> io::Result<(LimitedConn, SocketAddr)> {
        loop {
            let (stream, addr) = self.inner.accept().await?;
            if let Some(conn) = self.admit(stream, addr) {
                return Ok((conn, addr));
            }
        }
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr) -> Option<LimitedConn> {
        let ip = addr.ip();
        if !self.ip_counter.try_add(ip) {
            warn!("单IP连接数超限，拒绝连接: {}", addr);
            reject(stream);
            return None;
        }
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            self.ip_counter.done(ip);
            warn!("全局连接数超限，拒绝连接: {}", addr);
            reject(stream);
            return None;
        };
        debug!("接受连接: {}", addr);
        Some(LimitedConn {
            stream,
            release: Some(ConnRelease {
                ip,
                counter: self.ip_counter.clone(),
                _permit: permit,
            }),
        })
    }
}

#[allow(deprecated)]
fn reject(stream: TcpStream) {
    if let Err(e) = stream.set_linger(Some(Duration::ZERO)) {
        debug!("设置 SO_LINGER 失败: {}", e);
    }
    drop(stream);
}

impl axum::serve::Listener for LimitListener {
    type Io = LimitedConn;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.accept_limited().await {
                Ok(accepted) => return accepted,
                Err(e) => {
                    // 文件描述符耗尽等错误，稍后重试
                    error!("接受连接失败: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

struct ConnRelease {
    ip: IpAddr,
    counter: Arc<IpConnCounter>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ConnRelease {
    fn drop(&mut self) {
        self.counter.done(self.ip);
    }
}

/// 通过限流的连接，释放时归还全局许可与单IP计数
pub struct LimitedConn {
    stream: TcpStream,
    release: Option<ConnRelease>,
}

impl LimitedConn {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// 提前归还限流资源，重复调用无副作用
    pub fn release(&mut self) {
        self.release.take();
    }
}

impl AsyncRead for LimitedConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for LimitedConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}
