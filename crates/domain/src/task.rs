use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use edgefleet_core::serde_helpers::duration_millis;
use edgefleet_core::JsonMap;
use serde::{Deserialize, Serialize};

/// 任务阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskPhase {
    Waiting,
    Processing,
    Aborting,
    Succeeded,
    Failed,
    PartiallyFailed,
}

impl TaskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Waiting => "Waiting",
            TaskPhase::Processing => "Processing",
            TaskPhase::Aborting => "Aborting",
            TaskPhase::Succeeded => "Succeeded",
            TaskPhase::Failed => "Failed",
            TaskPhase::PartiallyFailed => "PartiallyFailed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskPhase::Succeeded | TaskPhase::Failed | TaskPhase::PartiallyFailed
        )
    }

    /// 阶段权重，系统触发的阶段迁移只能从低权重走向高权重
    pub fn weight(&self) -> u8 {
        match self {
            TaskPhase::Waiting => 0,
            TaskPhase::Processing => 1,
            TaskPhase::Aborting => 2,
            TaskPhase::Succeeded | TaskPhase::Failed | TaskPhase::PartiallyFailed => 3,
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => Ok(TaskPhase::Waiting),
            "Processing" => Ok(TaskPhase::Processing),
            "Aborting" => Ok(TaskPhase::Aborting),
            "Succeeded" => Ok(TaskPhase::Succeeded),
            "Failed" => Ok(TaskPhase::Failed),
            "PartiallyFailed" => Ok(TaskPhase::PartiallyFailed),
            _ => Err(format!("无效的任务阶段: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskPhase {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskPhase {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(s.parse::<TaskPhase>()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskPhase {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 判断阶段迁移是否允许
///
/// `to` 为 `None` 表示保持当前阶段。用户发起的更新只能原地更新或直接进入结束阶段，
/// 系统发起的更新（超时、取消、工作协程出队）还可以向更高权重的阶段推进。
pub fn allow_phase_transition(from: TaskPhase, to: Option<TaskPhase>, by_user: bool) -> bool {
    let to = to.unwrap_or(from);
    if from.is_finished() {
        return false;
    }
    if to.is_finished() || to == from {
        return true;
    }
    !by_user && from.weight() < to.weight()
}

/// 任务状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatus {
    pub phase: TaskPhase,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub data: JsonMap,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    pub fn waiting(created_at: DateTime<Utc>) -> Self {
        Self {
            phase: TaskPhase::Waiting,
            reason: String::new(),
            message: String::new(),
            progress: 0,
            data: JsonMap::new(),
            created_at: Some(created_at),
            started_at: None,
            finished_at: None,
        }
    }
}

/// 任务状态增量更新，`None` 字段保持原值
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskStatusUpdate {
    pub phase: Option<TaskPhase>,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub progress: Option<u8>,
    pub data: Option<JsonMap>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatusUpdate {
    pub fn phase(phase: TaskPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_data(mut self, data: JsonMap) -> Self {
        self.data = Some(data);
        self
    }

    /// 将增量合并到当前状态上，进入处理阶段时补齐开始时间，进入结束阶段时补齐结束时间
    pub fn apply_to(&self, current: &TaskStatus, now: DateTime<Utc>) -> TaskStatus {
        let mut next = current.clone();
        if let Some(phase) = self.phase {
            next.phase = phase;
        }
        if let Some(reason) = &self.reason {
            next.reason = reason.clone();
        }
        if let Some(message) = &self.message {
            next.message = message.clone();
        }
        if let Some(progress) = self.progress {
            next.progress = progress.min(100);
        }
        if let Some(data) = &self.data {
            next.data = data.clone();
        }
        if next.phase == TaskPhase::Processing && next.started_at.is_none() {
            next.started_at = Some(now);
        }
        if next.phase.is_finished() && next.finished_at.is_none() {
            next.finished_at = Some(self.finished_at.unwrap_or(now));
        }
        next
    }
}

/// 任务定义
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent_id: String,
    pub goroutine_pool: String,
    pub command: String,
    #[serde(default)]
    pub args: JsonMap,
    #[serde(default, with = "duration_millis")]
    pub wait_timeout: Duration,
    #[serde(default, with = "duration_millis")]
    pub heartbeat_timeout: Duration,
    #[serde(default, with = "duration_millis")]
    pub execute_timeout: Duration,
    #[serde(default, with = "duration_millis")]
    pub graceful_shutdown_timeout: Duration,
}

impl TaskSpec {
    pub fn new(pool: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            goroutine_pool: pool.into(),
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = parent_id.into();
        self
    }

    pub fn with_args(mut self, args: JsonMap) -> Self {
        self.args = args;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    pub fn is_master(&self) -> bool {
        self.parent_id.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub spec: TaskSpec,
    pub status: TaskStatus,
}

impl Task {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 '{}' (ID: {}, 命令: {}, 阶段: {})",
            self.spec.name, self.spec.id, self.spec.command, self.status.phase
        )
    }
}

/// 任务树节点，子任务通过 `parent_id` 关联
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTreeNode {
    pub current: Task,
    pub children: Vec<TaskTreeNode>,
}

impl TaskTreeNode {
    /// 后序遍历：先访问子节点，再访问当前节点
    pub fn walk<F>(&self, f: &mut F)
    where
        F: FnMut(&Task),
    {
        for child in &self.children {
            child.walk(f);
        }
        f(&self.current);
    }

    pub fn is_all_finished(&self) -> bool {
        self.current.status.phase.is_finished() && self.children.iter().all(|c| c.is_all_finished())
    }
}
