//! 证书轮换依赖的外部协作方

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use edgefleet_domain::{CertKind, FleetResult, NodeInfo};

use crate::payload::CertUpdatePayload;

/// 告警编号
///
/// 根证书与业务证书互为校验对：更新边缘根证书时，中心侧的业务证书链处于异常状态，反之亦然。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmId {
    CenterCaCertAbnormal,
    CenterSvcCertAbnormal,
    CenterCaCertUpdateAbnormal,
    CenterSvcCertUpdateAbnormal,
}

impl AlarmId {
    /// 轮换期间持续存在的告警
    pub fn rotating(kind: CertKind) -> Self {
        match kind {
            CertKind::EdgeCa => AlarmId::CenterSvcCertAbnormal,
            CertKind::EdgeSvc => AlarmId::CenterCaCertAbnormal,
        }
    }

    /// 轮换结束后仍有节点未成功时的告警
    pub fn update_failed(kind: CertKind) -> Self {
        match kind {
            CertKind::EdgeCa => AlarmId::CenterSvcCertUpdateAbnormal,
            CertKind::EdgeSvc => AlarmId::CenterCaCertUpdateAbnormal,
        }
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlarmId::CenterCaCertAbnormal => "CenterCaCertAbnormal",
            AlarmId::CenterSvcCertAbnormal => "CenterSvcCertAbnormal",
            AlarmId::CenterCaCertUpdateAbnormal => "CenterCaCertUpdateAbnormal",
            AlarmId::CenterSvcCertUpdateAbnormal => "CenterSvcCertUpdateAbnormal",
        };
        f.write_str(name)
    }
}

/// 节点清单
#[async_trait]
pub trait NodeInventory: Send + Sync {
    async fn list_nodes(&self) -> FleetResult<Vec<NodeInfo>>;
}

/// 按序列号向节点下发消息，返回值只表示下发是否成功
#[async_trait]
pub trait NodeNotifier: Send + Sync {
    async fn notify(&self, sn: &str, message: &str) -> FleetResult<()>;
}

#[async_trait]
pub trait AlarmSink: Send + Sync {
    async fn raise(&self, alarm: AlarmId) -> FleetResult<()>;

    async fn clear(&self, alarm: AlarmId) -> FleetResult<()>;
}

/// 通知本地信任库重新加载证书
#[async_trait]
pub trait TrustStoreNotifier: Send + Sync {
    async fn notify(&self, kind: CertKind, payload: &CertUpdatePayload) -> FleetResult<()>;
}

/// 上报整次轮换的结果
#[async_trait]
pub trait ResultReporter: Send + Sync {
    async fn report(&self, kind: CertKind, success: bool, desc: &str) -> FleetResult<()>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub inventory: Arc<dyn NodeInventory>,
    pub notifier: Arc<dyn NodeNotifier>,
    pub alarms: Arc<dyn AlarmSink>,
    pub trust_store: Arc<dyn TrustStoreNotifier>,
    pub reporter: Arc<dyn ResultReporter>,
}
