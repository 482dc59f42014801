//! 请求上下文
//!
//! 每个入站请求携带 `X-Request-Id` / `X-User-Id`，在请求处理期间通过
//! tokio 任务局部变量传递，日志通过 [`RequestContext::span`] 自动带上这两个字段。

use std::future::Future;

use tracing::Span;

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";
pub const USER_ID_HEADER: &str = "X-User-Id";

const MAX_HEADER_VALUE_LEN: usize = 128;

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: Option<String>,
}

impl RequestContext {
    /// 根据请求头构建上下文，缺少请求ID时自动生成
    pub fn from_header_values(request_id: Option<&str>, user_id: Option<&str>) -> Self {
        let request_id = request_id
            .map(str::trim)
            .filter(|v| is_valid_header_value(v))
            .map(str::to_string)
            .unwrap_or_else(new_request_id);
        let user_id = user_id
            .map(str::trim)
            .filter(|v| is_valid_header_value(v))
            .map(str::to_string);
        Self { request_id, user_id }
    }

    /// 当前任务所在的请求上下文
    pub fn current() -> Option<RequestContext> {
        REQUEST_CONTEXT.try_with(|ctx| ctx.clone()).ok()
    }

    /// 在该上下文中执行 future
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        REQUEST_CONTEXT.scope(self, fut).await
    }

    pub fn span(&self) -> Span {
        tracing::info_span!(
            "request",
            request_id = %self.request_id,
            user_id = %self.user_id.as_deref().unwrap_or("-"),
        )
    }
}

fn is_valid_header_value(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_HEADER_VALUE_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
