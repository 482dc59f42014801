use std::net::IpAddr;
use std::time::Duration;

use anyhow::Result;
use edgefleet_core::config::ListenerConfig;
use edgefleet_limiter::adapters::LimitListener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

fn config(concurrency: usize, ip_conn_limit: usize) -> ListenerConfig {
    ListenerConfig {
        concurrency,
        ip_conn_limit,
        cache_size: 16,
        ttl_seconds: 60,
    }
}

async fn assert_closed_by_server(stream: &mut TcpStream) {
    let mut buf = [0u8; 8];
    let read = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("被拒绝的连接应很快关闭");
    assert!(matches!(read, Ok(0) | Err(_)), "意外读到数据: {read:?}");
}

#[tokio::test]
async fn test_per_ip_limit_releases_on_drop() -> Result<()> {
    let mut listener = LimitListener::bind("127.0.0.1:0", &config(16, 1)).await?;
    let addr = listener.local_addr()?;
    let ip: IpAddr = "127.0.0.1".parse()?;

    let _client1 = TcpStream::connect(addr).await?;
    let (conn1, _) = listener.accept_limited().await?;
    assert_eq!(listener.ip_conn_count(&ip), 1);

    let accept = tokio::spawn(async move {
        let accepted = listener.accept_limited().await;
        (listener, accepted)
    });

    let mut client2 = TcpStream::connect(addr).await?;
    assert_closed_by_server(&mut client2).await;

    drop(conn1);
    let mut client3 = TcpStream::connect(addr).await?;
    let (listener, accepted) = timeout(Duration::from_secs(2), accept).await??;
    let (mut conn3, _) = accepted?;
    assert_eq!(listener.ip_conn_count(&ip), 1);

    conn3.write_all(b"hello").await?;
    let mut buf = [0u8; 5];
    client3.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"hello");

    conn3.release();
    conn3.release();
    assert_eq!(listener.ip_conn_count(&ip), 0);
    Ok(())
}

#[tokio::test]
async fn test_global_limit() -> Result<()> {
    let mut listener = LimitListener::bind("127.0.0.1:0", &config(1, 4)).await?;
    let addr = listener.local_addr()?;

    let _client1 = TcpStream::connect(addr).await?;
    let (conn1, _) = listener.accept_limited().await?;
    assert_eq!(listener.available_permits(), 0);

    let accept = tokio::spawn(async move {
        let accepted = listener.accept_limited().await;
        (listener, accepted)
    });
    let mut client2 = TcpStream::connect(addr).await?;
    assert_closed_by_server(&mut client2).await;

    drop(conn1);
    let _client3 = TcpStream::connect(addr).await?;
    let (listener, accepted) = timeout(Duration::from_secs(2), accept).await??;
    let (_conn3, _) = accepted?;
    assert_eq!(listener.available_permits(), 0);
    Ok(())
}
