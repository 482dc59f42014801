//! HTTP 限流中间件
//!
//! 处理顺序：请求体大小限制、请求上下文、单IP限流、全局并发限流、访问日志。

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use edgefleet_core::config::{ConfigValidator, LimitHandlerConfig};
use edgefleet_core::context::{REQUEST_ID_HEADER, USER_ID_HEADER};
use edgefleet_core::{FleetResult, RequestContext};
use http_body_util::Limited;
use lru::LruCache;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::concurrent::ConcurrentLimiter;
use crate::factory::{factory_from_config, IndependentLimiter, IndependentLimiterFactory};

pub const TOO_MANY_REQUESTS_BODY: &str = "429 Too Many Requests";

pub struct LimitHandler {
    limit_bytes: u64,
    print_log: bool,
    method_label: String,
    ip_factory: Box<dyn IndependentLimiterFactory>,
    ip_limiters: Mutex<LruCache<IpAddr, Arc<dyn IndependentLimiter>>>,
    concurrent: ConcurrentLimiter,
}

impl LimitHandler {
    pub fn new(config: &LimitHandlerConfig) -> FleetResult<Self> {
        config.validate()?;
        let ip_factory = factory_from_config(config)?;
        let cache_size = NonZeroUsize::new(config.effective_cache_size()).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            limit_bytes: config.limit_bytes,
            print_log: config.print_log,
            method_label: config.method.clone(),
            ip_factory,
            ip_limiters: Mutex::new(LruCache::new(cache_size)),
            concurrent: ConcurrentLimiter::new(config.total_concurrency),
        })
    }

    /// 单IP限流，首次出现的IP由工厂创建独立的限流器
    fn limit_single_ip(&self, ip: IpAddr) -> bool {
        let limiter = {
            let mut cache = self.ip_limiters.lock().unwrap_or_else(PoisonError::into_inner);
            match cache.get(&ip) {
                Some(limiter) => limiter.clone(),
                None => {
                    let limiter: Arc<dyn IndependentLimiter> = Arc::from(self.ip_factory.create());
                    cache.put(ip, limiter.clone());
                    limiter
                }
            }
        };
        limiter.allow()
    }

    fn content_too_large(&self, request: &Request) -> bool {
        request
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .is_some_and(|len| len > self.limit_bytes)
    }

    async fn process(&self, request: Request, next: Next, ctx: RequestContext) -> Response {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let client_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        if let Some(ip) = client_ip {
            if !self.limit_single_ip(ip) {
                if self.print_log {
                    warn!("单IP请求超限，拒绝请求: {} {} <429> | {}", method, path, ip);
                }
                return too_many_requests();
            }
        }

        let cancel = CancellationToken::new();
        let start = Instant::now();
        if !self.concurrent.allow(&cancel) {
            if self.print_log {
                warn!("全局并发超限，拒绝请求: {} {} <429>", method, path);
            }
            return too_many_requests();
        }

        let limit = usize::try_from(self.limit_bytes).unwrap_or(usize::MAX);
        let request = request.map(|body| Body::new(Limited::new(body, limit)));
        let response = next.run(request).await;
        cancel.cancel();

        if self.print_log {
            let latency_ms = start.elapsed().as_millis() as u64;
            info!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                latency_ms,
                request_id = %ctx.request_id,
                user_id = %ctx.user_id.as_deref().unwrap_or("-"),
                label = %self.method_label,
                "{} {} <{}> ({}ms) | {}",
                method,
                path,
                response.status().as_u16(),
                latency_ms,
                client_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            );
        }
        response
    }
}

fn too_many_requests() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, TOO_MANY_REQUESTS_BODY).into_response()
}

fn header_value<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers().get(name).and_then(|v| v.to_str().ok())
}

/// 通过 `axum::middleware::from_fn_with_state` 安装
pub async fn limit_middleware(
    State(handler): State<Arc<LimitHandler>>,
    request: Request,
    next: Next,
) -> Response {
    if handler.content_too_large(&request) {
        return (StatusCode::PAYLOAD_TOO_LARGE, "413 Request Entity Too Large").into_response();
    }

    let ctx = RequestContext::from_header_values(
        header_value(&request, REQUEST_ID_HEADER),
        header_value(&request, USER_ID_HEADER),
    );
    let span = ctx.span();
    ctx.clone()
        .scope(handler.process(request, next, ctx))
        .instrument(span)
        .await
}

/// 为路由安装限流中间件
pub fn with_limits<S>(router: Router<S>, handler: Arc<LimitHandler>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(axum::middleware::from_fn_with_state(handler, limit_middleware))
}
