use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use edgefleet_core::config::{IpLimiterVersion, LimitHandlerConfig};
use edgefleet_core::RequestContext;
use edgefleet_limiter::adapters::{with_limits, LimitHandler, TOO_MANY_REQUESTS_BODY};
use tower::ServiceExt;

fn app(config: LimitHandlerConfig) -> Result<Router> {
    let handler = Arc::new(LimitHandler::new(&config)?);
    let router = Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route(
            "/whoami",
            get(|| async {
                RequestContext::current()
                    .map(|ctx| format!("{}|{}", ctx.request_id, ctx.user_id.unwrap_or_default()))
                    .unwrap_or_default()
            }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                "done"
            }),
        )
        .route(
            "/upload",
            post(|body: axum::body::Bytes| async move { body.len().to_string() }),
        );
    Ok(with_limits(router, handler))
}

fn request(method: &str, uri: &str, ip: &str, body: Body) -> Request {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .expect("构建请求");
    let addr: SocketAddr = format!("{ip}:40000").parse().expect("地址");
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

async fn body_text(response: axum::response::Response) -> Result<String> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

#[tokio::test]
async fn test_per_ip_time_window() -> Result<()> {
    let app = app(LimitHandlerConfig {
        ip_concurrency: "1/60".to_string(),
        ..Default::default()
    })?;

    let first = app.clone().oneshot(request("GET", "/ping", "10.0.0.1", Body::empty())).await?;
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.clone().oneshot(request("GET", "/ping", "10.0.0.1", Body::empty())).await?;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_text(second).await?, TOO_MANY_REQUESTS_BODY);

    let other = app.oneshot(request("GET", "/ping", "10.0.0.2", Body::empty())).await?;
    assert_eq!(other.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_per_ip_token_bucket_burst() -> Result<()> {
    let app = app(LimitHandlerConfig {
        ip_concurrency: "1/60".to_string(),
        ip_burst: 3,
        version: IpLimiterVersion::V3,
        ..Default::default()
    })?;

    let mut statuses = Vec::new();
    for _ in 0..4 {
        let resp = app.clone().oneshot(request("GET", "/ping", "10.1.1.1", Body::empty())).await?;
        statuses.push(resp.status());
    }
    assert_eq!(
        statuses,
        vec![
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_global_concurrency_rejects_while_busy() -> Result<()> {
    let app = app(LimitHandlerConfig {
        total_concurrency: 1,
        ..Default::default()
    })?;

    let busy = tokio::spawn(
        app.clone()
            .oneshot(request("GET", "/slow", "10.0.0.1", Body::empty())),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rejected = app.clone().oneshot(request("GET", "/ping", "10.0.0.2", Body::empty())).await?;
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);

    assert_eq!(busy.await??.status(), StatusCode::OK);
    // 请求结束后令牌立即归还
    tokio::time::sleep(Duration::from_millis(20)).await;
    let after = app.oneshot(request("GET", "/ping", "10.0.0.3", Body::empty())).await?;
    assert_eq!(after.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_request_context_from_headers() -> Result<()> {
    let app = app(LimitHandlerConfig::default())?;

    let mut req = request("GET", "/whoami", "10.0.0.9", Body::empty());
    req.headers_mut().insert("X-Request-Id", "req-42".parse()?);
    req.headers_mut().insert("X-User-Id", "operator".parse()?);
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(body_text(resp).await?, "req-42|operator");

    let resp = app.oneshot(request("GET", "/whoami", "10.0.0.10", Body::empty())).await?;
    let text = body_text(resp).await?;
    let (request_id, user_id) = text.split_once('|').expect("格式");
    assert_eq!(request_id.len(), 32);
    assert!(user_id.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_body_limit() -> Result<()> {
    let app = app(LimitHandlerConfig {
        limit_bytes: 8,
        ..Default::default()
    })?;

    let mut req = request("POST", "/upload", "10.0.0.1", Body::from("0123456789"));
    req.headers_mut().insert("content-length", "10".parse()?);
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

    // 未声明长度的超长请求体在读取时被截断拒绝
    let resp = app
        .clone()
        .oneshot(request("POST", "/upload", "10.0.0.2", Body::from("0123456789")))
        .await?;
    assert_ne!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(request("POST", "/upload", "10.0.0.3", Body::from("0123")))
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await?, "4");
    Ok(())
}
