use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::{FleetError, FleetResult};

/// 协程池配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    pub id: String,
    pub max_concurrency: usize,
    pub max_capacity: usize,
}

/// 任务调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 内存中同时活跃的任务数上限
    pub max_active_tasks: i64,
    /// 数据库中允许保存的任务总数上限
    pub allowed_max_tasks_in_db: i64,
    /// 已结束主任务的历史保留数量
    pub max_history_master_tasks: i64,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active_tasks: 1000,
            allowed_max_tasks_in_db: 10000,
            max_history_master_tasks: 100,
            pools: vec![PoolConfig {
                id: "default".to_string(),
                max_concurrency: 4,
                max_capacity: 64,
            }],
        }
    }
}

impl ConfigValidator for SchedulerConfig {
    fn validate(&self) -> FleetResult<()> {
        ValidationUtils::validate_range(self.max_active_tasks, 1, 1_000_000, "scheduler.max_active_tasks")?;
        ValidationUtils::validate_range(
            self.allowed_max_tasks_in_db,
            1,
            10_000_000,
            "scheduler.allowed_max_tasks_in_db",
        )?;
        ValidationUtils::validate_range(
            self.max_history_master_tasks,
            0,
            self.allowed_max_tasks_in_db,
            "scheduler.max_history_master_tasks",
        )?;

        let mut seen = std::collections::HashSet::new();
        for pool in &self.pools {
            ValidationUtils::validate_not_empty(&pool.id, "scheduler.pools.id")?;
            if !seen.insert(pool.id.as_str()) {
                return Err(FleetError::Validation(format!("协程池ID重复: {}", pool.id)));
            }
            ValidationUtils::validate_range(pool.max_concurrency, 1, 1024, "scheduler.pools.max_concurrency")?;
            ValidationUtils::validate_range(pool.max_capacity, 1, 100_000, "scheduler.pools.max_capacity")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_validation() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = config.clone();
        invalid.max_active_tasks = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.pools.push(invalid.pools[0].clone());
        assert!(invalid.validate().is_err());

        let mut invalid = config;
        invalid.pools[0].max_concurrency = 0;
        assert!(invalid.validate().is_err());
    }
}
