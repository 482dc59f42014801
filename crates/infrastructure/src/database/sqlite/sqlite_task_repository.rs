use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use edgefleet_core::serde_helpers::{
    duration_from_millis, duration_to_millis, json_map_from_text, json_map_to_text,
};
use edgefleet_core::{FleetError, FleetResult};
use edgefleet_domain::repositories::{format_timestamp, parse_timestamp, DispatchFn};
use edgefleet_domain::{
    Task, TaskPhase, TaskRepository, TaskSpec, TaskStatus, TaskStatusUpdate, TaskTreeNode,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};

use crate::error_handling::{OperationContext, RepositoryOperation};

/// 任务树的最大加载深度
pub const MAX_TREE_DEPTH: usize = 16;

const TASK_COLUMNS: &str = "id, name, parent_id, goroutine_pool, command, args, \
    wait_timeout_ms, heartbeat_timeout_ms, execute_timeout_ms, graceful_shutdown_timeout_ms, \
    phase, reason, message, progress, data, created_at, started_at, finished_at";

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> FleetResult<Task> {
        let args: Option<String> = row.try_get("args")?;
        let data: Option<String> = row.try_get("data")?;
        let created_at: Option<String> = row.try_get("created_at")?;
        let started_at: Option<String> = row.try_get("started_at")?;
        let finished_at: Option<String> = row.try_get("finished_at")?;
        let progress: i64 = row.try_get("progress")?;

        Ok(Task {
            spec: TaskSpec {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                parent_id: row.try_get("parent_id")?,
                goroutine_pool: row.try_get("goroutine_pool")?,
                command: row.try_get("command")?,
                args: json_map_from_text(args.as_deref())?,
                wait_timeout: duration_from_millis(row.try_get("wait_timeout_ms")?),
                heartbeat_timeout: duration_from_millis(row.try_get("heartbeat_timeout_ms")?),
                execute_timeout: duration_from_millis(row.try_get("execute_timeout_ms")?),
                graceful_shutdown_timeout: duration_from_millis(
                    row.try_get("graceful_shutdown_timeout_ms")?,
                ),
            },
            status: TaskStatus {
                phase: row.try_get("phase")?,
                reason: row.try_get("reason")?,
                message: row.try_get("message")?,
                progress: progress.clamp(0, 100) as u8,
                data: json_map_from_text(data.as_deref())?,
                created_at: parse_timestamp(created_at.as_deref())?,
                started_at: parse_timestamp(started_at.as_deref())?,
                finished_at: parse_timestamp(finished_at.as_deref())?,
            },
        })
    }

    async fn fetch_children(&self, parent_ids: &[String]) -> FleetResult<Vec<Task>> {
        if parent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ctx = OperationContext::new(RepositoryOperation::Query, "子任务");
        let placeholders = vec!["?"; parent_ids.len()].join(", ");
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_id IN ({placeholders}) ORDER BY created_at, id"
        );
        let mut query = sqlx::query(&sql);
        for id in parent_ids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ctx.db_error(e))?;
        rows.iter().map(Self::row_to_task).collect()
    }
}

fn build_tree(current: Task, children_of: &mut HashMap<String, Vec<Task>>) -> TaskTreeNode {
    let children = children_of
        .remove(current.id())
        .unwrap_or_default()
        .into_iter()
        .map(|child| build_tree(child, children_of))
        .collect();
    TaskTreeNode { current, children }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn migrate(&self) -> FleetResult<()> {
        let ctx = OperationContext::new(RepositoryOperation::Migrate, "任务表");
        debug!("执行任务表迁移");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                parent_id TEXT NOT NULL DEFAULT '',
                goroutine_pool TEXT NOT NULL,
                command TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '{}',
                wait_timeout_ms INTEGER NOT NULL DEFAULT 0,
                heartbeat_timeout_ms INTEGER NOT NULL DEFAULT 0,
                execute_timeout_ms INTEGER NOT NULL DEFAULT 0,
                graceful_shutdown_timeout_ms INTEGER NOT NULL DEFAULT 0,
                phase TEXT NOT NULL DEFAULT 'Waiting',
                reason TEXT NOT NULL DEFAULT '',
                message TEXT NOT NULL DEFAULT '',
                progress INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL DEFAULT '{}',
                created_at TEXT,
                started_at TEXT,
                finished_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ctx.db_error(e))?;

        for index_sql in [
            "CREATE INDEX IF NOT EXISTS idx_tasks_parent_id ON tasks(parent_id)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_phase ON tasks(phase)",
        ] {
            sqlx::query(index_sql)
                .execute(&self.pool)
                .await
                .map_err(|e| ctx.db_error(e))?;
        }
        Ok(())
    }

    async fn count_tasks(&self) -> FleetResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self, task), fields(task_id = %task.spec.id))]
    async fn create_task(&self, task: &Task) -> FleetResult<()> {
        let ctx = OperationContext::task(RepositoryOperation::Create, task.id());
        let mut conn = self.pool.acquire().await.map_err(|e| ctx.db_error(e))?;
        insert_task(&mut *conn, task)
            .await
            .map_err(|e| ctx.db_error(e))?;
        debug!("创建任务成功: {}", task.entity_description());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> FleetResult<Option<Task>> {
        let ctx = OperationContext::task(RepositoryOperation::Read, id);
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ctx.db_error(e))?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    #[instrument(skip(self, update), fields(task_id = %id))]
    async fn update_task_status(
        &self,
        id: &str,
        update: &TaskStatusUpdate,
    ) -> FleetResult<(Task, u64)> {
        let ctx = OperationContext::task(RepositoryOperation::Update, id);
        let mut tx = self.pool.begin().await.map_err(|e| ctx.db_error(e))?;

        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| ctx.db_error(e))?;
        let mut task = match row {
            Some(row) => Self::row_to_task(&row)?,
            None => return Err(FleetError::TaskNotFound { id: id.to_string() }),
        };

        let next = update.apply_to(&task.status, Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET phase = ?, reason = ?, message = ?, progress = ?, data = ?,
                started_at = ?, finished_at = ?
            WHERE id = ? AND phase IN ('Waiting', 'Processing', 'Aborting')
            "#,
        )
        .bind(next.phase)
        .bind(&next.reason)
        .bind(&next.message)
        .bind(next.progress as i64)
        .bind(json_map_to_text(&next.data)?)
        .bind(next.started_at.as_ref().map(format_timestamp))
        .bind(next.finished_at.as_ref().map(format_timestamp))
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| ctx.db_error(e))?;

        tx.commit().await.map_err(|e| ctx.db_error(e))?;

        let rows = result.rows_affected();
        if rows > 0 {
            task.status = next;
        }
        Ok((task, rows))
    }

    async fn get_task_tree(&self, id: &str) -> FleetResult<Option<TaskTreeNode>> {
        let Some(root) = self.get_task(id).await? else {
            return Ok(None);
        };

        let mut children_of: HashMap<String, Vec<Task>> = HashMap::new();
        let mut frontier = vec![root.spec.id.clone()];
        for _ in 0..MAX_TREE_DEPTH {
            let children = self.fetch_children(&frontier).await?;
            if children.is_empty() {
                break;
            }
            frontier = children.iter().map(|t| t.spec.id.clone()).collect();
            for child in children {
                children_of
                    .entry(child.spec.parent_id.clone())
                    .or_default()
                    .push(child);
            }
        }

        Ok(Some(build_tree(root, &mut children_of)))
    }

    async fn get_finished_master_tasks(&self) -> FleetResult<Vec<Task>> {
        let ctx = OperationContext::new(RepositoryOperation::Query, "已结束的主任务");
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_id = '' \
             AND phase IN ('Succeeded', 'Failed', 'PartiallyFailed') ORDER BY finished_at"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ctx.db_error(e))?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn delete_task(&self, id: &str) -> FleetResult<u64> {
        let ctx = OperationContext::task(RepositoryOperation::Delete, id);
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| ctx.db_error(e))?;
        Ok(result.rows_affected())
    }

    async fn update_unfinished_tasks_to_failed(&self, reason: &str) -> FleetResult<u64> {
        let ctx = OperationContext::new(RepositoryOperation::BatchUpdate, "未结束的任务");
        let result = sqlx::query(
            r#"
            UPDATE tasks SET phase = ?, reason = ?, finished_at = ?
            WHERE phase IN ('Waiting', 'Processing', 'Aborting')
            "#,
        )
        .bind(TaskPhase::Failed)
        .bind(reason)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| ctx.db_error(e))?;

        let rows = result.rows_affected();
        if rows > 0 {
            info!("已将 {} 个遗留的未结束任务置为失败", rows);
        }
        Ok(rows)
    }

    #[instrument(skip(self, task, dispatch), fields(task_id = %task.spec.id))]
    async fn submit_in_transaction(
        &self,
        task: &Task,
        max_in_db: i64,
        dispatch: DispatchFn,
    ) -> FleetResult<()> {
        let ctx = OperationContext::task(RepositoryOperation::Create, task.id());
        let mut tx = self.pool.begin().await.map_err(|e| ctx.db_error(e))?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| ctx.db_error(e))?;
        if count >= max_in_db {
            return Err(FleetError::TaskCountExceeded { max: max_in_db });
        }

        insert_task(&mut *tx, task).await.map_err(|e| ctx.db_error(e))?;

        // 派发失败时事务随 tx 一起回滚
        dispatch()?;

        tx.commit().await.map_err(|e| ctx.db_error(e))?;
        Ok(())
    }
}

async fn insert_task(conn: &mut sqlx::SqliteConnection, task: &Task) -> Result<(), sqlx::Error> {
    let args = serde_json::to_string(&task.spec.args).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let data =
        serde_json::to_string(&task.status.data).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(&format!(
        "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&task.spec.id)
    .bind(&task.spec.name)
    .bind(&task.spec.parent_id)
    .bind(&task.spec.goroutine_pool)
    .bind(&task.spec.command)
    .bind(args)
    .bind(duration_to_millis(task.spec.wait_timeout))
    .bind(duration_to_millis(task.spec.heartbeat_timeout))
    .bind(duration_to_millis(task.spec.execute_timeout))
    .bind(duration_to_millis(task.spec.graceful_shutdown_timeout))
    .bind(task.status.phase)
    .bind(&task.status.reason)
    .bind(&task.status.message)
    .bind(task.status.progress as i64)
    .bind(data)
    .bind(task.status.created_at.as_ref().map(format_timestamp))
    .bind(task.status.started_at.as_ref().map(format_timestamp))
    .bind(task.status.finished_at.as_ref().map(format_timestamp))
    .execute(conn)
    .await?;
    Ok(())
}
