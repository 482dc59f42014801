use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request};
use axum::http::StatusCode;
use axum::Router;
use edgefleet::app::Application;
use edgefleet_core::config::EdgeNodeConfig;
use edgefleet_core::AppConfig;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::time::{sleep, Instant};
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(10);

fn config(trust_dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.url = "sqlite::memory:".to_string();
    config.http.enabled = false;
    config.http.limit.ip_concurrency = "1000/1".to_string();
    config.cert_update.notify_interval_ms = 1;
    config.cert_update.exit_check_interval_seconds = 1;
    config.cert_update.failed_check_interval_seconds = 1;
    config.cert_update.trust_store_dir = trust_dir.path().to_string_lossy().into_owned();
    config.cert_update.nodes = ["edge-01", "edge-02"]
        .iter()
        .enumerate()
        .map(|(i, sn)| EdgeNodeConfig {
            sn: sn.to_string(),
            ip: format!("10.0.0.{}", i + 1),
        })
        .collect();
    config
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request {
    let builder = Request::builder().method(method).uri(uri);
    let mut req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("构建请求");
    let addr: SocketAddr = "127.0.0.1:40000".parse().expect("地址");
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(request(method, uri, body)).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, serde_json::from_slice(&bytes)?))
}

async fn wait_notifications(app: &Router, sn: &str) -> Result<Vec<Value>> {
    let deadline = Instant::now() + WAIT;
    loop {
        let (status, body) = call(app, "GET", &format!("/nodes/{sn}/notifications"), None).await?;
        assert_eq!(status, StatusCode::OK);
        let messages = body["data"].as_array().cloned().unwrap_or_default();
        if !messages.is_empty() {
            return Ok(messages);
        }
        assert!(Instant::now() < deadline, "节点 {sn} 未收到通知");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_health_and_unknown_task() -> Result<()> {
    let trust_dir = TempDir::new()?;
    let app = Application::new(config(&trust_dir)).await?;
    let router = app.http_router()?;

    let (status, body) = call(&router, "GET", "/health", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["rotations"].as_array().map(Vec::len), Some(2));

    let (status, body) = call(&router, "GET", "/tasks/000000000000000000000000", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    let (status, _) = call(&router, "GET", "/nodes/edge-99/notifications", None).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_submit_to_unknown_pool_rejected() -> Result<()> {
    let trust_dir = TempDir::new()?;
    let app = Application::new(config(&trust_dir)).await?;
    let router = app.http_router()?;

    let spec = json!({"goroutine_pool": "missing", "command": "cert-update"});
    let (status, _) = call(&router, "POST", "/tasks", Some(spec)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_cert_rotation_over_http() -> Result<()> {
    let trust_dir = TempDir::new()?;
    let app = Application::new(config(&trust_dir)).await?;
    let router = app.http_router()?;

    let spec = json!({
        "name": "根证书轮换",
        "goroutine_pool": "default",
        "command": "cert-update",
        "args": {"certType": "EdgeCa", "caContent": "NEW-CA"}
    });
    let (status, body) = call(&router, "POST", "/tasks", Some(spec)).await?;
    assert_eq!(status, StatusCode::OK);
    let id = body["data"]["id"].as_str().unwrap_or_default().to_string();
    assert_eq!(id.len(), 24);

    for sn in ["edge-01", "edge-02"] {
        let messages = wait_notifications(&router, sn).await?;
        let payload: Value = serde_json::from_str(messages[0].as_str().unwrap_or_default())?;
        assert_eq!(payload["certType"], "EdgeCa");
        assert_eq!(payload["caContent"], "NEW-CA");

        let result = json!({"certType": "EdgeCa", "resultCode": 2, "desc": ""});
        let (status, _) = call(&router, "POST", &format!("/nodes/{sn}/result"), Some(result)).await?;
        assert_eq!(status, StatusCode::OK);
    }

    let deadline = Instant::now() + WAIT;
    loop {
        let (status, body) = call(&router, "GET", &format!("/tasks/{id}"), None).await?;
        assert_eq!(status, StatusCode::OK);
        if body["data"]["status"]["phase"] == "Succeeded" {
            break;
        }
        assert!(Instant::now() < deadline, "证书轮换任务未完成: {body}");
        sleep(Duration::from_millis(50)).await;
    }

    let active = trust_dir.path().join("EdgeCa.pem");
    assert_eq!(std::fs::read_to_string(active)?, "NEW-CA");

    // 轮换结束后不再接受结果
    let result = json!({"certType": "EdgeCa", "resultCode": 2});
    let (status, _) = call(&router, "POST", "/nodes/edge-01/result", Some(result)).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    Ok(())
}
