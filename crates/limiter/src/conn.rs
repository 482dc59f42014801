use std::sync::{Mutex, PoisonError};

use edgefleet_core::{FleetError, FleetResult};

/// 连接数限制器，计数始终保持在 `[0, limit]` 区间内
#[derive(Debug)]
pub struct ConnLimiter {
    limit: usize,
    count: Mutex<usize>,
}

impl ConnLimiter {
    pub fn new(limit: usize) -> FleetResult<Self> {
        if limit == 0 {
            return Err(FleetError::Validation("连接数上限必须大于0".to_string()));
        }
        Ok(Self {
            limit,
            count: Mutex::new(0),
        })
    }

    /// 未达上限时计数加一并返回 true
    pub fn conn_add(&self) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if *count >= self.limit {
            return false;
        }
        *count += 1;
        true
    }

    pub fn conn_done(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
    }

    pub fn current(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
