//! 领域仓储抽象
//!
//! 调度器与证书轮换只依赖这里的接口，具体的 SQLite 实现在 infrastructure 中

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edgefleet_core::FleetResult;

use crate::cert_status::{CertKind, CertStatusRow, CertUpdateStatus, NodeInfo};
use crate::task::{Task, TaskStatusUpdate, TaskTreeNode};

/// 在事务内执行的派发动作，返回错误时事务回滚
pub type DispatchFn = Box<dyn FnOnce() -> FleetResult<()> + Send>;

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 创建表结构（幂等）
    async fn migrate(&self) -> FleetResult<()>;

    async fn count_tasks(&self) -> FleetResult<i64>;

    async fn create_task(&self, task: &Task) -> FleetResult<()>;

    async fn get_task(&self, id: &str) -> FleetResult<Option<Task>>;

    /// 只更新未结束的任务，返回更新后的任务与受影响行数
    async fn update_task_status(
        &self,
        id: &str,
        update: &TaskStatusUpdate,
    ) -> FleetResult<(Task, u64)>;

    async fn get_task_tree(&self, id: &str) -> FleetResult<Option<TaskTreeNode>>;

    /// 所有已结束的主任务（无父任务）
    async fn get_finished_master_tasks(&self) -> FleetResult<Vec<Task>>;

    async fn delete_task(&self, id: &str) -> FleetResult<u64>;

    /// 进程重启后把遗留的未结束任务统一置为失败
    async fn update_unfinished_tasks_to_failed(&self, reason: &str) -> FleetResult<u64>;

    /// 计数、插入与派发在同一个事务中完成
    async fn submit_in_transaction(
        &self,
        task: &Task,
        max_in_db: i64,
        dispatch: DispatchFn,
    ) -> FleetResult<()>;
}

/// 证书轮换节点状态仓储，每种证书一张表
#[async_trait]
pub trait CertStatusRepository: Send + Sync {
    fn kind(&self) -> CertKind;

    /// 删除并重建状态表
    async fn rebuild_table(&self) -> FleetResult<()>;

    async fn drop_table(&self) -> FleetResult<()>;

    async fn insert_nodes(&self, nodes: &[NodeInfo], notify_timestamp: i64) -> FleetResult<()>;

    async fn delete_by_sn(&self, sns: &[String]) -> FleetResult<u64>;

    async fn update_status(&self, sn: &str, status: CertUpdateStatus) -> FleetResult<u64>;

    async fn update_notify_timestamp(&self, sn: &str, timestamp: i64) -> FleetResult<u64>;

    /// 尚未下发过的初始记录
    async fn query_init_records(&self) -> FleetResult<Vec<CertStatusRow>>;

    async fn query_unsuccessful_records(&self) -> FleetResult<Vec<CertStatusRow>>;

    async fn count_unsuccessful(&self) -> FleetResult<i64>;
}

/// 数据库时间戳统一使用 RFC 3339 文本
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub fn parse_timestamp(text: Option<&str>) -> FleetResult<Option<DateTime<Utc>>> {
    match text {
        None | Some("") => Ok(None),
        Some(text) => DateTime::parse_from_rfc3339(text)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|e| {
                edgefleet_core::FleetError::DatabaseOperation(format!("无效的时间戳 {text}: {e}"))
            }),
    }
}
