use std::fmt;

use serde::{Deserialize, Serialize};

/// 证书类型，每种证书独立一张节点状态表
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CertKind {
    EdgeCa,
    EdgeSvc,
}

impl CertKind {
    pub fn table_name(&self) -> &'static str {
        match self {
            CertKind::EdgeCa => "edge_ca_cert_status",
            CertKind::EdgeSvc => "edge_svc_cert_status",
        }
    }

    /// 下发载荷中的 `certType` 取值
    pub fn cert_type(&self) -> &'static str {
        match self {
            CertKind::EdgeCa => "EdgeCa",
            CertKind::EdgeSvc => "EdgeSvc",
        }
    }
}

impl fmt::Display for CertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cert_type())
    }
}

/// 节点证书更新状态，数值与表中存储一致
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum CertUpdateStatus {
    Init = 1,
    Success = 2,
    Fail = 3,
}

impl CertUpdateStatus {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(CertUpdateStatus::Init),
            2 => Some(CertUpdateStatus::Success),
            3 => Some(CertUpdateStatus::Fail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertStatusRow {
    pub id: i64,
    pub sn: String,
    pub ip: String,
    pub status: CertUpdateStatus,
    /// 最近一次下发的 Unix 秒，0 表示尚未下发
    pub notify_timestamp: i64,
}

/// 边缘节点快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub sn: String,
    pub ip: String,
}

impl NodeInfo {
    pub fn new(sn: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            sn: sn.into(),
            ip: ip.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        for status in [CertUpdateStatus::Init, CertUpdateStatus::Success, CertUpdateStatus::Fail] {
            assert_eq!(CertUpdateStatus::from_i64(status.as_i64()), Some(status));
        }
        assert_eq!(CertUpdateStatus::Success.as_i64(), 2);
        assert_eq!(CertUpdateStatus::from_i64(0), None);
    }

    #[test]
    fn test_kind_tables_are_distinct() {
        assert_ne!(CertKind::EdgeCa.table_name(), CertKind::EdgeSvc.table_name());
        assert_eq!(CertKind::EdgeSvc.to_string(), "EdgeSvc");
    }
}
