//! 全集群证书轮换
//!
//! 每种证书同一时间最多一次轮换。一次轮换的流程：
//!
//! 1. 产生轮换期间的常驻告警
//! 2. 重建节点状态表，写入节点快照
//! 3. 通知本地信任库
//! 4. 并发运行节点同步、结果吸收、失败重发、退出检查四个工作协程，同时逐个通知节点
//! 5. 退出检查发现全部节点成功或收到强制更新后结束轮换
//! 6. 正常结束时做收尾：强制刷新信任库、上报结果、对失败节点告警、删除状态表
//! 7. 清除告警、复位运行标志；被强制更新打断时以强制载荷重新发起轮换

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use edgefleet_core::config::CertUpdateConfig;
use edgefleet_domain::{CertKind, CertStatusRepository, CertUpdateStatus, FleetError, FleetResult, NodeInfo};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborators::{AlarmId, Collaborators};
use crate::payload::{CertUpdatePayload, NodeDelta, NodeResult};

pub const NOT_RUNNING: u8 = 0;
pub const IN_RUNNING: u8 = 1;

/// 节点变化与结果通道的缓冲深度
const WORKING_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateSettings {
    pub max_node: usize,
    /// 相邻两次节点通知的间隔
    pub notify_interval: Duration,
    pub failed_check_interval: Duration,
    pub exit_check_interval: Duration,
    /// 业务证书重发前需要等待的时间
    pub update_timeout: Duration,
}

impl From<&CertUpdateConfig> for UpdateSettings {
    fn from(config: &CertUpdateConfig) -> Self {
        Self {
            max_node: config.max_node,
            notify_interval: Duration::from_millis(config.notify_interval_ms),
            failed_check_interval: Duration::from_secs(config.failed_check_interval_seconds),
            exit_check_interval: Duration::from_secs(config.exit_check_interval_seconds),
            update_timeout: Duration::from_secs(config.update_timeout_seconds),
        }
    }
}

/// 轮换结束的方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// 全部节点更新成功
    Completed,
    /// 被强制更新打断，载荷会用于下一次轮换
    Forced(CertUpdatePayload),
    /// 出错中止
    Aborted(String),
}

impl StopReason {
    fn is_normal(&self) -> bool {
        !matches!(self, StopReason::Aborted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationSummary {
    pub kind: CertKind,
    pub reason: StopReason,
    /// 收尾时仍未成功的节点数，异常结束时为 `None`
    pub unsuccessful: Option<usize>,
}

/// 发起更新的结果
#[derive(Debug)]
pub enum StartOutcome {
    Started(JoinHandle<RotationSummary>),
    /// 强制载荷已转交给正在运行的轮换
    Forwarded,
}

pub struct CertUpdater {
    kind: CertKind,
    settings: UpdateSettings,
    repo: Arc<dyn CertStatusRepository>,
    deps: Collaborators,
    flag: AtomicU8,
    force_tx: mpsc::Sender<CertUpdatePayload>,
    force_rx: Mutex<mpsc::Receiver<CertUpdatePayload>>,
    node_changes_tx: mpsc::Sender<NodeDelta>,
    node_changes_rx: Mutex<mpsc::Receiver<NodeDelta>>,
    results_tx: mpsc::Sender<NodeResult>,
    results_rx: Mutex<mpsc::Receiver<NodeResult>>,
    /// 节点同步与失败重发互斥
    working: Mutex<()>,
}

impl CertUpdater {
    pub fn new(
        repo: Arc<dyn CertStatusRepository>,
        settings: UpdateSettings,
        deps: Collaborators,
    ) -> Arc<Self> {
        let (force_tx, force_rx) = mpsc::channel(1);
        let (node_changes_tx, node_changes_rx) = mpsc::channel(WORKING_QUEUE_SIZE);
        let (results_tx, results_rx) = mpsc::channel(WORKING_QUEUE_SIZE);
        Arc::new(Self {
            kind: repo.kind(),
            settings,
            repo,
            deps,
            flag: AtomicU8::new(NOT_RUNNING),
            force_tx,
            force_rx: Mutex::new(force_rx),
            node_changes_tx,
            node_changes_rx: Mutex::new(node_changes_rx),
            results_tx,
            results_rx: Mutex::new(results_rx),
            working: Mutex::new(()),
        })
    }

    pub fn kind(&self) -> CertKind {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        self.flag.load(Ordering::SeqCst) == IN_RUNNING
    }

    /// 发起一次轮换
    ///
    /// 已有轮换在运行时，强制载荷转交给它并由它结束当前轮换，其他载荷直接拒绝。
    pub fn start_update(self: &Arc<Self>, payload: CertUpdatePayload) -> FleetResult<StartOutcome> {
        let kind = payload.kind()?;
        if kind != self.kind {
            return Err(FleetError::Validation(format!(
                "证书类型不匹配: 期望 {}，实际 {}",
                self.kind, kind
            )));
        }

        if self
            .flag
            .compare_exchange(NOT_RUNNING, IN_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let updater = self.clone();
            return Ok(StartOutcome::Started(tokio::spawn(updater.run_rotation(payload))));
        }

        if !payload.force {
            warn!(kind = %self.kind, "证书正在更新中，请稍后重试");
            return Err(FleetError::CertUpdate("already running".to_string()));
        }
        match self.force_tx.try_send(payload) {
            Ok(()) => {
                info!(kind = %self.kind, "证书将以强制方式更新");
                Ok(StartOutcome::Forwarded)
            }
            Err(_) => {
                warn!(kind = %self.kind, "已有待处理的强制更新");
                Err(FleetError::CertUpdate("force update already pending".to_string()))
            }
        }
    }

    /// 上报节点清单变化，没有轮换在运行时丢弃
    pub fn report_node_changes(&self, delta: NodeDelta) {
        if !self.is_running() {
            warn!(kind = %self.kind, "没有正在运行的证书更新，忽略节点变化");
            return;
        }
        if let Err(e) = self.node_changes_tx.try_send(delta) {
            warn!(kind = %self.kind, "节点变化队列已满，丢弃: {}", e);
        }
    }

    /// 上报单个节点的更新结果，没有轮换在运行时丢弃
    pub fn report_result(&self, result: NodeResult) {
        if !self.is_running() {
            warn!(kind = %self.kind, sn = %result.sn, "没有正在运行的证书更新，忽略节点结果");
            return;
        }
        if let Err(e) = self.results_tx.try_send(result) {
            warn!(kind = %self.kind, "节点结果队列已满，丢弃: {}", e);
        }
    }

    async fn run_rotation(self: Arc<Self>, payload: CertUpdatePayload) -> RotationSummary {
        info!(kind = %self.kind, force = payload.force, "开始更新边缘证书");
        let alarm = AlarmId::rotating(self.kind);
        if let Err(e) = self.deps.alarms.raise(alarm).await {
            error!(kind = %self.kind, "产生证书更新告警失败: {}", e);
        }

        let reason = match self.rotate(&payload).await {
            Ok(reason) => reason,
            Err(e) => {
                error!(kind = %self.kind, "证书更新中止: {}", e);
                StopReason::Aborted(e.to_string())
            }
        };

        let unsuccessful = if reason.is_normal() {
            let final_payload = match &reason {
                StopReason::Forced(forced) => forced,
                _ => &payload,
            };
            self.post_process(final_payload, &reason).await
        } else {
            warn!(kind = %self.kind, "证书更新异常结束，跳过收尾");
            None
        };

        if let Err(e) = self.deps.alarms.clear(alarm).await {
            error!(kind = %self.kind, "清除证书更新告警失败: {}", e);
        }
        // 告警清除后才释放运行标志，下一次轮换的告警不会被本次清除
        self.flag.store(NOT_RUNNING, Ordering::SeqCst);
        info!(kind = %self.kind, "边缘证书更新流程结束");

        let pending = match &reason {
            StopReason::Forced(forced) => Some(forced.clone()),
            _ => self.force_rx.lock().await.try_recv().ok(),
        };
        if let Some(next) = pending {
            if let Err(e) = self.start_update(next.forced()) {
                error!(kind = %self.kind, "以强制方式重新发起证书更新失败: {}", e);
            }
        }

        RotationSummary {
            kind: self.kind,
            reason,
            unsuccessful,
        }
    }

    async fn rotate(&self, payload: &CertUpdatePayload) -> FleetResult<StopReason> {
        self.repo.rebuild_table().await?;

        let nodes = self.deps.inventory.list_nodes().await?;
        if nodes.is_empty() {
            return Err(FleetError::CertUpdate("没有找到边缘节点".to_string()));
        }
        if nodes.len() > self.settings.max_node {
            return Err(FleetError::CertUpdate(format!(
                "边缘节点数量 {} 超过上限 {}",
                nodes.len(),
                self.settings.max_node
            )));
        }
        self.repo.insert_nodes(&nodes, 0).await?;

        self.deps.trust_store.notify(self.kind, payload).await?;
        let message = payload.node_message()?;

        let mut force_rx = self.force_rx.lock().await;
        let mut changes = self.node_changes_rx.lock().await;
        let mut results = self.results_rx.lock().await;
        while changes.try_recv().is_ok() {}
        while results.try_recv().is_ok() {}

        let cancel = CancellationToken::new();
        let (reason, _, _, _, _) = tokio::join!(
            self.watch_exit(&mut force_rx, &cancel),
            self.sync_nodes(&mut changes, &message, &cancel),
            self.absorb_results(&mut results, &cancel),
            self.redrive_failed(nodes.len(), &message, &cancel),
            self.notify_init_nodes(&message, &cancel),
        );
        Ok(reason)
    }

    /// 唯一可以取消本次轮换的协程
    async fn watch_exit(
        &self,
        force_rx: &mut mpsc::Receiver<CertUpdatePayload>,
        cancel: &CancellationToken,
    ) -> StopReason {
        let period = self.settings.exit_check_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break StopReason::Aborted("退出检查被取消".to_string()),
                Some(forced) = force_rx.recv() => {
                    warn!(kind = %self.kind, "收到强制更新，结束当前证书更新");
                    break StopReason::Forced(forced);
                }
                _ = ticker.tick() => match self.repo.count_unsuccessful().await {
                    Ok(0) => break StopReason::Completed,
                    Ok(remaining) => debug!(kind = %self.kind, remaining, "仍有节点未完成证书更新"),
                    Err(e) => error!(kind = %self.kind, "查询未成功的节点失败: {}", e),
                },
            }
        };
        cancel.cancel();
        reason
    }

    async fn sync_nodes(
        &self,
        changes: &mut mpsc::Receiver<NodeDelta>,
        message: &str,
        cancel: &CancellationToken,
    ) {
        loop {
            let delta = tokio::select! {
                _ = cancel.cancelled() => break,
                delta = changes.recv() => match delta {
                    Some(delta) => delta,
                    None => break,
                },
            };
            if delta.is_empty() {
                warn!(kind = %self.kind, "节点变化为空，跳过本次同步");
                continue;
            }
            let _guard = self.working.lock().await;
            if let Err(e) = self.add_nodes(&delta.added, message).await {
                error!(kind = %self.kind, "同步新增节点失败: {}", e);
            }
            if !delta.deleted.is_empty() {
                let sns: Vec<String> = delta.deleted.iter().map(|node| node.sn.clone()).collect();
                if let Err(e) = self.repo.delete_by_sn(&sns).await {
                    error!(kind = %self.kind, "同步删除节点失败: {}", e);
                }
            }
            info!(
                kind = %self.kind,
                added = delta.added.len(),
                deleted = delta.deleted.len(),
                "节点信息同步完成"
            );
        }
        debug!(kind = %self.kind, "节点同步已停止");
    }

    async fn add_nodes(&self, nodes: &[NodeInfo], message: &str) -> FleetResult<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        self.repo.insert_nodes(nodes, Utc::now().timestamp()).await?;
        for node in nodes {
            if let Err(e) = self.deps.notifier.notify(&node.sn, message).await {
                error!(kind = %self.kind, sn = %node.sn, "通知新增节点更新证书失败: {}", e);
                self.repo.update_status(&node.sn, CertUpdateStatus::Fail).await?;
            }
        }
        Ok(())
    }

    async fn absorb_results(&self, results: &mut mpsc::Receiver<NodeResult>, cancel: &CancellationToken) {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = results.recv() => match result {
                    Some(result) => result,
                    None => break,
                },
            };
            let status = if result.result_code == CertUpdateStatus::Success.as_i64() {
                CertUpdateStatus::Success
            } else {
                error!(kind = %self.kind, sn = %result.sn, "节点上报更新失败: {}", result.desc);
                CertUpdateStatus::Fail
            };
            if let Err(e) = self.repo.update_status(&result.sn, status).await {
                error!(kind = %self.kind, sn = %result.sn, "更新节点状态失败: {}", e);
            }
        }
        debug!(kind = %self.kind, "结果同步已停止");
    }

    /// 首次通知全部节点后开始周期性重发
    async fn redrive_failed(&self, initial_nodes: usize, message: &str, cancel: &CancellationToken) {
        let grace = self
            .settings
            .notify_interval
            .saturating_mul(u32::try_from(initial_nodes).unwrap_or(u32::MAX));
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(grace) => {}
        }

        let period = self.settings.failed_check_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            if let Err(e) = self.process_failed_records(message).await {
                error!(kind = %self.kind, "重发失败节点的通知出错: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
        }
        debug!(kind = %self.kind, "失败重发已停止");
    }

    async fn process_failed_records(&self, message: &str) -> FleetResult<()> {
        let _guard = self.working.lock().await;
        let records = self.repo.query_unsuccessful_records().await?;
        for record in records {
            let now = Utc::now().timestamp();
            if self.kind == CertKind::EdgeSvc {
                let elapsed = now - record.notify_timestamp;
                if elapsed < 0 {
                    error!(
                        sn = %record.sn,
                        now,
                        notify_timestamp = record.notify_timestamp,
                        "节点通知时间异常"
                    );
                    continue;
                }
                if Duration::from_secs(elapsed.unsigned_abs()) < self.settings.update_timeout {
                    continue;
                }
            }
            if let Err(e) = self.deps.notifier.notify(&record.sn, message).await {
                error!(kind = %self.kind, sn = %record.sn, "重发证书更新通知失败: {}", e);
                self.repo.update_status(&record.sn, CertUpdateStatus::Fail).await?;
            }
            self.repo.update_notify_timestamp(&record.sn, now).await?;
        }
        Ok(())
    }

    /// 逐个通知尚未通知过的节点，节点之间间隔 `notify_interval`
    async fn notify_init_nodes(&self, message: &str, cancel: &CancellationToken) {
        let records = match self.repo.query_init_records().await {
            Ok(records) => records,
            Err(e) => {
                error!(kind = %self.kind, "查询待通知节点失败: {}", e);
                return;
            }
        };
        for record in records {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.deps.notifier.notify(&record.sn, message).await {
                error!(kind = %self.kind, sn = %record.sn, "通知节点更新证书失败: {}", e);
                if let Err(e) = self.repo.update_status(&record.sn, CertUpdateStatus::Fail).await {
                    error!(sn = %record.sn, "更新节点状态失败: {}", e);
                }
            }
            if let Err(e) = self
                .repo
                .update_notify_timestamp(&record.sn, Utc::now().timestamp())
                .await
            {
                error!(sn = %record.sn, "更新节点通知时间失败: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.settings.notify_interval) => {}
            }
        }
        info!(kind = %self.kind, "首轮节点通知完成");
    }

    /// 正常结束后的收尾，返回仍未成功的节点数
    async fn post_process(&self, payload: &CertUpdatePayload, reason: &StopReason) -> Option<usize> {
        let forced = payload.clone().forced();
        if let Err(e) = self.deps.trust_store.notify(self.kind, &forced).await {
            error!(kind = %self.kind, "强制刷新信任库失败: {}", e);
            return None;
        }

        if *reason == StopReason::Completed {
            if let Err(e) = self.deps.reporter.report(self.kind, true, "").await {
                error!(kind = %self.kind, "上报证书更新结果失败: {}", e);
            }
        }

        let unsuccessful = match self.repo.query_unsuccessful_records().await {
            Ok(records) => records,
            Err(e) => {
                error!(kind = %self.kind, "查询未成功的节点失败: {}", e);
                Vec::new()
            }
        };
        if !unsuccessful.is_empty() {
            let sns: Vec<&str> = unsuccessful.iter().map(|record| record.sn.as_str()).collect();
            warn!(kind = %self.kind, "以下节点未成功更新证书，请尽快处理: {:?}", sns);
            if let Err(e) = self.deps.alarms.raise(AlarmId::update_failed(self.kind)).await {
                error!(kind = %self.kind, "产生证书更新失败告警失败: {}", e);
            }
        }

        if let Err(e) = self.repo.drop_table().await {
            error!(kind = %self.kind, table = self.kind.table_name(), "删除节点状态表失败: {}", e);
        } else {
            info!(kind = %self.kind, table = self.kind.table_name(), "节点状态表已删除");
        }
        Some(unsuccessful.len())
    }
}
