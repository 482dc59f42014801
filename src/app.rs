use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::serve::ListenerExt;
use axum::Router;
use edgefleet_certupdater::{CertUpdateExecutorFactory, CertUpdater, Collaborators, UpdateSettings};
use edgefleet_core::AppConfig;
use edgefleet_dispatcher::{Scheduler, SchedulerSpec};
use edgefleet_domain::{CertKind, GoroutinePoolSpec};
use edgefleet_infrastructure::DatabaseManager;
use edgefleet_limiter::adapters::{LimitHandler, LimitListener};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collaborators::{FileTrustStore, LogAlarmSink, LogResultReporter, Mailbox, StaticInventory};
use crate::http::{router, AppState};

/// 主应用程序
pub struct Application {
    config: AppConfig,
    db: DatabaseManager,
    scheduler: Arc<Scheduler>,
    updaters: Arc<HashMap<CertKind, Arc<CertUpdater>>>,
    mailbox: Arc<Mailbox>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let db = DatabaseManager::new(&config.database)
            .await
            .context("连接数据库失败")?;

        let scheduler = Scheduler::start(
            db.task_repository(),
            SchedulerSpec::from(&config.scheduler),
            CancellationToken::new(),
        )
        .await
        .context("启动调度器失败")?;
        for pool in &config.scheduler.pools {
            scheduler.register_goroutine_pool(GoroutinePoolSpec::new(
                &pool.id,
                pool.max_concurrency,
                pool.max_capacity,
            ));
        }

        let mailbox = Arc::new(Mailbox::new(&config.cert_update.nodes));
        let deps = Collaborators {
            inventory: Arc::new(StaticInventory::new(&config.cert_update.nodes)),
            notifier: mailbox.clone(),
            alarms: Arc::new(LogAlarmSink),
            trust_store: Arc::new(FileTrustStore::new(&config.cert_update.trust_store_dir)),
            reporter: Arc::new(LogResultReporter),
        };
        let settings = UpdateSettings::from(&config.cert_update);
        let updaters: HashMap<CertKind, Arc<CertUpdater>> = [CertKind::EdgeCa, CertKind::EdgeSvc]
            .into_iter()
            .map(|kind| {
                let updater = CertUpdater::new(db.cert_status_repository(kind), settings, deps.clone());
                (kind, updater)
            })
            .collect();
        scheduler.register_executor_factory(Arc::new(CertUpdateExecutorFactory::new(
            updaters.values().cloned(),
        )));

        info!(
            pools = config.scheduler.pools.len(),
            nodes = config.cert_update.nodes.len(),
            "应用初始化完成"
        );
        Ok(Self {
            config,
            db,
            scheduler,
            updaters: Arc::new(updaters),
            mailbox,
        })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn state(&self) -> AppState {
        AppState {
            scheduler: self.scheduler.clone(),
            updaters: self.updaters.clone(),
            mailbox: self.mailbox.clone(),
        }
    }

    /// 安装了限流中间件的路由
    pub fn http_router(&self) -> Result<Router> {
        let limits = Arc::new(LimitHandler::new(&self.config.http.limit).context("创建限流处理器失败")?);
        Ok(router(self.state(), limits))
    }

    /// 运行直到收到关闭信号，随后停止调度器并关闭数据库
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        if self.config.http.enabled {
            let http = &self.config.http;
            let app = self.http_router()?;
            let listener = LimitListener::bind(&http.bind_address, &http.listener)
                .await
                .with_context(|| format!("监听地址失败: {}", http.bind_address))?;
            info!("HTTP 服务监听: {}", listener.local_addr()?);

            axum::serve(listener.tap_io(|_| {}), app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .context("HTTP 服务异常退出")?;
        } else {
            warn!("HTTP 服务未启用");
            let _ = shutdown_rx.recv().await;
        }

        info!("停止调度器");
        self.scheduler.cancellation().cancel();
        self.db.close().await;
        Ok(())
    }
}
