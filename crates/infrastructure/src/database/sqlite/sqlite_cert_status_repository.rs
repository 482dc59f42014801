use async_trait::async_trait;
use edgefleet_core::{FleetError, FleetResult};
use edgefleet_domain::{CertKind, CertStatusRepository, CertStatusRow, CertUpdateStatus, NodeInfo};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error_handling::{OperationContext, RepositoryOperation};

/// 证书轮换节点状态表，表名由证书类型决定，每次轮换前删表重建
pub struct SqliteCertStatusRepository {
    pool: SqlitePool,
    kind: CertKind,
}

impl SqliteCertStatusRepository {
    pub fn new(pool: SqlitePool, kind: CertKind) -> Self {
        Self { pool, kind }
    }

    fn table(&self) -> &'static str {
        self.kind.table_name()
    }

    fn context(&self, operation: RepositoryOperation) -> OperationContext {
        OperationContext::new(operation, format!("证书状态表 {}", self.table()))
    }

    fn row_to_status(row: &SqliteRow) -> FleetResult<CertStatusRow> {
        let status: i64 = row.try_get("status")?;
        Ok(CertStatusRow {
            id: row.try_get("id")?,
            sn: row.try_get("sn")?,
            ip: row.try_get("ip")?,
            status: CertUpdateStatus::from_i64(status).ok_or_else(|| {
                FleetError::DatabaseOperation(format!("无效的证书更新状态: {status}"))
            })?,
            notify_timestamp: row.try_get("notify_timestamp")?,
        })
    }

    async fn query_rows(&self, filter: &str) -> FleetResult<Vec<CertStatusRow>> {
        let ctx = self.context(RepositoryOperation::Query);
        let sql = format!(
            "SELECT id, sn, ip, status, notify_timestamp FROM {} WHERE {} ORDER BY id",
            self.table(),
            filter
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ctx.db_error(e))?;
        rows.iter().map(Self::row_to_status).collect()
    }
}

#[async_trait]
impl CertStatusRepository for SqliteCertStatusRepository {
    fn kind(&self) -> CertKind {
        self.kind
    }

    async fn rebuild_table(&self) -> FleetResult<()> {
        let ctx = self.context(RepositoryOperation::Migrate);
        let mut tx = self.pool.begin().await.map_err(|e| ctx.db_error(e))?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.table()))
            .execute(&mut *tx)
            .await
            .map_err(|e| ctx.db_error(e))?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sn TEXT NOT NULL UNIQUE,
                ip TEXT NOT NULL DEFAULT '',
                status INTEGER NOT NULL DEFAULT 1,
                notify_timestamp INTEGER NOT NULL DEFAULT 0
            )
            "#,
            self.table()
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| ctx.db_error(e))?;
        tx.commit().await.map_err(|e| ctx.db_error(e))?;
        debug!("已重建证书状态表 {}", self.table());
        Ok(())
    }

    async fn drop_table(&self) -> FleetResult<()> {
        let ctx = self.context(RepositoryOperation::Delete);
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.table()))
            .execute(&self.pool)
            .await
            .map_err(|e| ctx.db_error(e))?;
        Ok(())
    }

    async fn insert_nodes(&self, nodes: &[NodeInfo], notify_timestamp: i64) -> FleetResult<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let ctx = self.context(RepositoryOperation::Create);
        let sql = format!(
            "INSERT INTO {} (sn, ip, status, notify_timestamp) VALUES (?, ?, ?, ?) \
             ON CONFLICT(sn) DO UPDATE SET ip = excluded.ip, status = excluded.status, \
             notify_timestamp = excluded.notify_timestamp",
            self.table()
        );
        let mut tx = self.pool.begin().await.map_err(|e| ctx.db_error(e))?;
        for node in nodes {
            sqlx::query(&sql)
                .bind(&node.sn)
                .bind(&node.ip)
                .bind(CertUpdateStatus::Init.as_i64())
                .bind(notify_timestamp)
                .execute(&mut *tx)
                .await
                .map_err(|e| ctx.db_error(e))?;
        }
        tx.commit().await.map_err(|e| ctx.db_error(e))?;
        Ok(())
    }

    async fn delete_by_sn(&self, sns: &[String]) -> FleetResult<u64> {
        if sns.is_empty() {
            return Ok(0);
        }
        let ctx = self.context(RepositoryOperation::Delete);
        let placeholders = vec!["?"; sns.len()].join(", ");
        let sql = format!("DELETE FROM {} WHERE sn IN ({})", self.table(), placeholders);
        let mut query = sqlx::query(&sql);
        for sn in sns {
            query = query.bind(sn);
        }
        let result = query.execute(&self.pool).await.map_err(|e| ctx.db_error(e))?;
        Ok(result.rows_affected())
    }

    async fn update_status(&self, sn: &str, status: CertUpdateStatus) -> FleetResult<u64> {
        let ctx = self.context(RepositoryOperation::Update);
        let result = sqlx::query(&format!("UPDATE {} SET status = ? WHERE sn = ?", self.table()))
            .bind(status.as_i64())
            .bind(sn)
            .execute(&self.pool)
            .await
            .map_err(|e| ctx.db_error(e))?;
        Ok(result.rows_affected())
    }

    async fn update_notify_timestamp(&self, sn: &str, timestamp: i64) -> FleetResult<u64> {
        let ctx = self.context(RepositoryOperation::Update);
        let result = sqlx::query(&format!(
            "UPDATE {} SET notify_timestamp = ? WHERE sn = ?",
            self.table()
        ))
        .bind(timestamp)
        .bind(sn)
        .execute(&self.pool)
        .await
        .map_err(|e| ctx.db_error(e))?;
        Ok(result.rows_affected())
    }

    async fn query_init_records(&self) -> FleetResult<Vec<CertStatusRow>> {
        self.query_rows("status = 1 AND notify_timestamp = 0").await
    }

    async fn query_unsuccessful_records(&self) -> FleetResult<Vec<CertStatusRow>> {
        self.query_rows("status != 2").await
    }

    async fn count_unsuccessful(&self) -> FleetResult<i64> {
        let ctx = self.context(RepositoryOperation::Query);
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE status != 2",
            self.table()
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ctx.db_error(e))?;
        Ok(count)
    }
}
