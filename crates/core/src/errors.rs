use thiserror::Error;

/// 边缘集群核心错误类型定义
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("任务执行器工厂未找到: {command}")]
    FactoryNotFound { command: String },

    #[error("协程池未找到: {pool}")]
    GoroutinePoolNotFound { pool: String },

    #[error("协程池等待队列已满: {pool}")]
    FullQueue { pool: String },

    #[error("活跃任务数量已达上限")]
    TooManyTask,

    #[error("数据库中任务数量已达上限: {max}")]
    TaskCountExceeded { max: i64 },

    #[error("没有运行中的子任务")]
    NoRunningSubTask,

    #[error("操作已取消")]
    Cancelled,

    #[error("操作超时")]
    Timeout,

    #[error("未更新任何记录")]
    NoRowsAffected,

    #[error("任务已结束")]
    TaskAlreadyFinished,

    #[error("证书错误: {0}")]
    Cert(String),

    #[error("证书更新错误: {0}")]
    CertUpdate(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl FleetError {
    /// 容量类错误：直接拒绝，不在内部重试
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            FleetError::FullQueue { .. } | FleetError::TooManyTask | FleetError::TaskCountExceeded { .. }
        )
    }

    /// 未找到类错误：视为配置或编程错误
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FleetError::TaskNotFound { .. }
                | FleetError::FactoryNotFound { .. }
                | FleetError::GoroutinePoolNotFound { .. }
        )
    }
}

/// 统一的Result类型
pub type FleetResult<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FleetError::TaskNotFound {
            id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "任务未找到: abc");

        let err = FleetError::FullQueue {
            pool: "default".to_string(),
        };
        assert!(err.to_string().contains("default"));
    }

    #[test]
    fn test_error_kinds() {
        assert!(FleetError::TooManyTask.is_capacity());
        assert!(FleetError::FullQueue { pool: "p".into() }.is_capacity());
        assert!(!FleetError::Cancelled.is_capacity());
        assert!(FleetError::GoroutinePoolNotFound { pool: "p".into() }.is_not_found());
        assert!(!FleetError::Timeout.is_not_found());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: FleetError = io.into();
        assert!(matches!(err, FleetError::Io(_)));
    }
}
