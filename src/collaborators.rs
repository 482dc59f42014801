//! 证书轮换在本进程内的协作方实现
//!
//! 节点通过 HTTP 拉取各自的通知邮箱，并把更新结果回报到 `/nodes/{sn}/result`。

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use edgefleet_certupdater::{AlarmId, AlarmSink, CertUpdatePayload, NodeInventory, NodeNotifier, ResultReporter, TrustStoreNotifier};
use edgefleet_core::config::EdgeNodeConfig;
use edgefleet_core::fs::{make_sure_dir, write_with_mode, MODE_400, MODE_DIR_SHARED};
use edgefleet_domain::{CertKind, FleetError, FleetResult, NodeInfo};
use tracing::{error, info, warn};

/// 单个节点邮箱中最多积压的通知数
const MAILBOX_DEPTH: usize = 16;

/// 配置文件中登记的节点清单
pub struct StaticInventory {
    nodes: Vec<NodeInfo>,
}

impl StaticInventory {
    pub fn new(nodes: &[EdgeNodeConfig]) -> Self {
        Self {
            nodes: nodes.iter().map(|n| NodeInfo::new(&n.sn, &n.ip)).collect(),
        }
    }
}

#[async_trait]
impl NodeInventory for StaticInventory {
    async fn list_nodes(&self) -> FleetResult<Vec<NodeInfo>> {
        Ok(self.nodes.clone())
    }
}

/// 按序列号分组的通知邮箱，只接受已登记的节点
#[derive(Default)]
pub struct Mailbox {
    boxes: Mutex<HashMap<String, VecDeque<String>>>,
}

impl Mailbox {
    pub fn new(nodes: &[EdgeNodeConfig]) -> Self {
        let boxes = nodes.iter().map(|n| (n.sn.clone(), VecDeque::new())).collect();
        Self {
            boxes: Mutex::new(boxes),
        }
    }

    /// 取走节点积压的全部通知
    pub fn drain(&self, sn: &str) -> Option<Vec<String>> {
        let mut boxes = self.boxes.lock().unwrap_or_else(PoisonError::into_inner);
        boxes.get_mut(sn).map(|queue| queue.drain(..).collect())
    }
}

#[async_trait]
impl NodeNotifier for Mailbox {
    async fn notify(&self, sn: &str, message: &str) -> FleetResult<()> {
        let mut boxes = self.boxes.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = boxes
            .get_mut(sn)
            .ok_or_else(|| FleetError::Validation(format!("未登记的节点: {sn}")))?;
        if queue.len() >= MAILBOX_DEPTH {
            return Err(FleetError::Internal(format!("节点 {sn} 的通知邮箱已满")));
        }
        queue.push_back(message.to_string());
        Ok(())
    }
}

/// 告警写入日志
pub struct LogAlarmSink;

#[async_trait]
impl AlarmSink for LogAlarmSink {
    async fn raise(&self, alarm: AlarmId) -> FleetResult<()> {
        warn!(alarm = %alarm, "产生告警");
        Ok(())
    }

    async fn clear(&self, alarm: AlarmId) -> FleetResult<()> {
        info!(alarm = %alarm, "清除告警");
        Ok(())
    }
}

/// 把新的 CA 证书写入信任库目录
///
/// 普通通知写入 `<kind>.pending.pem`，强制刷新时写入 `<kind>.pem` 并删除待生效文件。
pub struct FileTrustStore {
    dir: PathBuf,
}

impl FileTrustStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, kind: CertKind, pending: bool) -> PathBuf {
        let suffix = if pending { ".pending.pem" } else { ".pem" };
        self.dir.join(format!("{}{}", kind.cert_type(), suffix))
    }
}

#[async_trait]
impl TrustStoreNotifier for FileTrustStore {
    async fn notify(&self, kind: CertKind, payload: &CertUpdatePayload) -> FleetResult<()> {
        make_sure_dir(&self.dir, MODE_DIR_SHARED)?;
        let mut content = payload.ca_content.clone();
        if let Some(issuer) = &payload.issuer_content {
            content.push_str(issuer);
        }
        let target = self.path(kind, !payload.force);
        if target.exists() {
            std::fs::remove_file(&target)?;
        }
        write_with_mode(&target, content.as_bytes(), MODE_400)?;
        if payload.force {
            let pending = self.path(kind, true);
            if pending.exists() {
                std::fs::remove_file(&pending)?;
            }
        }
        info!(kind = %kind, path = %target.display(), force = payload.force, "信任库已更新");
        Ok(())
    }
}

/// 轮换结果写入日志
pub struct LogResultReporter;

#[async_trait]
impl ResultReporter for LogResultReporter {
    async fn report(&self, kind: CertKind, success: bool, desc: &str) -> FleetResult<()> {
        if success {
            info!(kind = %kind, "证书轮换成功");
        } else {
            error!(kind = %kind, desc, "证书轮换失败");
        }
        Ok(())
    }
}
