use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::{FleetError, FleetResult};

/// 默认请求体大小上限
pub const DEFAULT_DATA_LIMIT: u64 = 10 * 1024 * 1024;
/// 全局并发上限
pub const DEFAULT_MAX_CONCURRENCY: usize = 1024;
/// 单IP限流器缓存默认容量
pub const DEFAULT_CACHE_SIZE: usize = 100 * 1024;
/// 单IP请求频率配置格式，例如 "2/1" 表示每1秒2个请求
pub const IP_REQ_LIMIT_REG: &str = r"^[1-9]\d{0,2}/[1-9]\d{0,2}$";

const MAX_METHOD_LEN: usize = 20;

fn ip_req_limit_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(IP_REQ_LIMIT_REG).expect("IP限流正则表达式固定有效"))
}

/// 单IP限流器版本
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IpLimiterVersion {
    /// 时间窗口限流
    #[default]
    V2,
    /// 令牌桶限流，允许突发
    V3,
}

/// HTTP 限流处理器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitHandlerConfig {
    pub print_log: bool,
    #[serde(default)]
    pub method: String,
    pub limit_bytes: u64,
    pub total_concurrency: usize,
    pub ip_concurrency: String,
    #[serde(default)]
    pub ip_burst: u32,
    #[serde(default)]
    pub cache_size: usize,
    #[serde(default)]
    pub version: IpLimiterVersion,
}

impl Default for LimitHandlerConfig {
    fn default() -> Self {
        Self {
            print_log: true,
            method: String::new(),
            limit_bytes: DEFAULT_DATA_LIMIT,
            total_concurrency: DEFAULT_MAX_CONCURRENCY,
            ip_concurrency: "20/1".to_string(),
            ip_burst: 0,
            cache_size: DEFAULT_CACHE_SIZE,
            version: IpLimiterVersion::V2,
        }
    }
}

impl LimitHandlerConfig {
    /// 解析 "N/M"，返回 (N, M)
    pub fn parse_ip_concurrency(&self) -> FleetResult<(u32, u32)> {
        let invalid = || FleetError::Validation(format!("ip_concurrency 参数错误: {}", self.ip_concurrency));
        let (count, seconds) = self.ip_concurrency.split_once('/').ok_or_else(invalid)?;
        let count: u32 = count.parse().map_err(|_| invalid())?;
        let seconds: u32 = seconds.parse().map_err(|_| invalid())?;
        if count == 0 || seconds == 0 {
            return Err(invalid());
        }
        Ok((count, seconds))
    }

    /// 非法或未设置时使用默认缓存容量
    pub fn effective_cache_size(&self) -> usize {
        if self.cache_size == 0 {
            DEFAULT_CACHE_SIZE
        } else {
            self.cache_size
        }
    }
}

impl ConfigValidator for LimitHandlerConfig {
    fn validate(&self) -> FleetResult<()> {
        ValidationUtils::validate_range(
            self.total_concurrency,
            1,
            DEFAULT_MAX_CONCURRENCY,
            "http.limit.total_concurrency",
        )?;
        if self.method.len() > MAX_METHOD_LEN {
            return Err(FleetError::Validation("http.limit.method 参数错误".to_string()));
        }
        if !ip_req_limit_regex().is_match(&self.ip_concurrency) {
            return Err(FleetError::Validation(format!(
                "http.limit.ip_concurrency 参数错误: {}",
                self.ip_concurrency
            )));
        }
        self.parse_ip_concurrency()?;
        if self.version == IpLimiterVersion::V3 && self.ip_burst == 0 {
            return Err(FleetError::Validation(
                "http.limit.ip_burst 在 v3 模式下必须大于0".to_string(),
            ));
        }
        if self.limit_bytes == 0 {
            return Err(FleetError::Validation("http.limit.limit_bytes 必须大于0".to_string()));
        }
        Ok(())
    }
}

/// 限流监听器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerConfig {
    pub concurrency: usize,
    pub ip_conn_limit: usize,
    #[serde(default)]
    pub cache_size: usize,
    pub ttl_seconds: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_MAX_CONCURRENCY,
            ip_conn_limit: 64,
            cache_size: DEFAULT_CACHE_SIZE,
            ttl_seconds: 3600,
        }
    }
}

impl ConfigValidator for ListenerConfig {
    fn validate(&self) -> FleetResult<()> {
        ValidationUtils::validate_range(self.concurrency, 1, 65535, "http.listener.concurrency")?;
        ValidationUtils::validate_range(self.ip_conn_limit, 1, 65535, "http.listener.ip_conn_limit")?;
        ValidationUtils::validate_range(self.ttl_seconds, 1, 86400, "http.listener.ttl_seconds")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind_address: String,
    #[serde(default)]
    pub limit: LimitHandlerConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8443".to_string(),
            limit: LimitHandlerConfig::default(),
            listener: ListenerConfig::default(),
        }
    }
}

impl ConfigValidator for HttpConfig {
    fn validate(&self) -> FleetResult<()> {
        if !self.enabled {
            return Ok(());
        }
        self.bind_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| FleetError::Validation(format!("http.bind_address 无效: {e}")))?;
        self.limit.validate()?;
        self.listener.validate()?;
        Ok(())
    }
}
