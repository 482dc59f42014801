use serde::{Deserialize, Serialize};

/// 协程池定义
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GoroutinePoolSpec {
    pub id: String,
    /// 工作协程数量
    pub max_concurrency: usize,
    /// 等待队列深度，队列满时提交返回 FullQueue
    pub max_capacity: usize,
}

impl GoroutinePoolSpec {
    pub fn new(id: impl Into<String>, max_concurrency: usize, max_capacity: usize) -> Self {
        Self {
            id: id.into(),
            max_concurrency,
            max_capacity,
        }
    }
}

impl From<&edgefleet_core::config::PoolConfig> for GoroutinePoolSpec {
    fn from(config: &edgefleet_core::config::PoolConfig) -> Self {
        Self::new(config.id.clone(), config.max_concurrency, config.max_capacity)
    }
}
