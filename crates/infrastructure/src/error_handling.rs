//! 仓储操作的错误上下文
//!
//! 数据库错误统一附带一层操作与实体描述后转换为 `FleetError`，并记录错误日志

use std::fmt;

use edgefleet_core::FleetError;
use sqlx::Error as SqlxError;
use tracing::error;

#[derive(Debug, Clone, Copy)]
pub enum RepositoryOperation {
    Migrate,
    Create,
    Read,
    Update,
    Delete,
    Query,
    BatchUpdate,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Migrate => write!(f, "迁移"),
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "查询"),
            RepositoryOperation::Update => write!(f, "更新"),
            RepositoryOperation::Delete => write!(f, "删除"),
            RepositoryOperation::Query => write!(f, "查询"),
            RepositoryOperation::BatchUpdate => write!(f, "批量更新"),
        }
    }
}

/// 单次仓储操作的上下文
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation: RepositoryOperation,
    pub entity: String,
}

impl OperationContext {
    pub fn new(operation: RepositoryOperation, entity: impl Into<String>) -> Self {
        Self {
            operation,
            entity: entity.into(),
        }
    }

    pub fn task(operation: RepositoryOperation, task_id: &str) -> Self {
        Self::new(operation, format!("任务 (ID: {task_id})"))
    }

    /// 把 sqlx 错误转换为带上下文的领域错误
    pub fn db_error(&self, err: SqlxError) -> FleetError {
        let message = match &err {
            SqlxError::Database(db_error) => match db_error.constraint() {
                Some(constraint) => format!(
                    "{}{}时发生数据库约束冲突: {}",
                    self.operation, self.entity, constraint
                ),
                None if db_error.is_unique_violation() => {
                    format!("{}{}时发生唯一约束冲突: {}", self.operation, self.entity, db_error)
                }
                None => format!("{}{}时发生数据库错误: {}", self.operation, self.entity, db_error),
            },
            SqlxError::PoolClosed => format!("{}{}时数据库连接池已关闭", self.operation, self.entity),
            SqlxError::PoolTimedOut => format!("{}{}时数据库连接池超时", self.operation, self.entity),
            other => format!("{}{}时发生数据库错误: {}", self.operation, self.entity, other),
        };
        error!(error = %err, "{}", message);
        FleetError::DatabaseOperation(message)
    }
}
