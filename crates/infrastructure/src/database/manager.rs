use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use edgefleet_core::config::DatabaseConfig;
use edgefleet_core::FleetResult;
use edgefleet_domain::{CertKind, CertStatusRepository, TaskRepository};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::sqlite::{SqliteCertStatusRepository, SqliteTaskRepository};

/// 统一数据库管理器，持有 SQLite 连接池并创建各仓储
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> FleetResult<Self> {
        let in_memory = is_memory_url(&config.url);
        let mut options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // 内存库每个连接都是独立的数据库，只能使用单连接
        let (max, min) = if in_memory {
            (1, 1)
        } else {
            (config.max_connections, config.min_connections)
        };

        debug!("连接数据库: {}", config.url);
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max)
            .min_connections(min)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds));
        if in_memory {
            // 连接被回收后内存库即丢失
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;
        info!("数据库连接池已建立，最大连接数: {}", max);

        Ok(Self { pool })
    }

    /// 测试与嵌入场景使用的内存数据库
    pub async fn in_memory() -> FleetResult<Self> {
        Self::new(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> FleetResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await
    }

    pub fn task_repository(&self) -> Arc<dyn TaskRepository> {
        Arc::new(SqliteTaskRepository::new(self.pool.clone()))
    }

    pub fn cert_status_repository(&self, kind: CertKind) -> Arc<dyn CertStatusRepository> {
        Arc::new(SqliteCertStatusRepository::new(self.pool.clone(), kind))
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_url_detection() {
        assert!(is_memory_url("sqlite::memory:"));
        assert!(is_memory_url("sqlite://file:db?mode=memory"));
        assert!(!is_memory_url("sqlite://edgefleet.db"));
    }

    #[tokio::test]
    async fn test_file_database_is_created() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("fleet.db").display());
        let manager = DatabaseManager::new(&DatabaseConfig {
            url,
            ..DatabaseConfig::default()
        })
        .await
        .unwrap();
        manager.health_check().await.unwrap();
        assert!(dir.path().join("fleet.db").exists());
        manager.close().await;
    }
}
