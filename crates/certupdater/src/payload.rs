use edgefleet_domain::{CertKind, FleetError, FleetResult, NodeInfo};
use serde::{Deserialize, Serialize};

/// 证书更新载荷，节点收到的是它的 JSON 形式
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertUpdatePayload {
    pub cert_type: String,
    #[serde(default)]
    pub ca_content: String,
    /// 业务证书轮换时附带的签发 CA 证书链
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_content: Option<String>,
    /// 强制更新只在进程内传递
    #[serde(skip)]
    pub force: bool,
}

impl CertUpdatePayload {
    pub fn new(kind: CertKind, ca_content: impl Into<String>) -> Self {
        Self {
            cert_type: kind.cert_type().to_string(),
            ca_content: ca_content.into(),
            ..Default::default()
        }
    }

    pub fn with_issuer(mut self, issuer_content: impl Into<String>) -> Self {
        self.issuer_content = Some(issuer_content.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn kind(&self) -> FleetResult<CertKind> {
        match self.cert_type.as_str() {
            "EdgeCa" => Ok(CertKind::EdgeCa),
            "EdgeSvc" => Ok(CertKind::EdgeSvc),
            other => Err(FleetError::Validation(format!("无效的证书类型: {other}"))),
        }
    }

    /// 下发给节点的消息体
    pub fn node_message(&self) -> FleetResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// 轮换期间节点清单的变化
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeDelta {
    pub added: Vec<NodeInfo>,
    pub deleted: Vec<NodeInfo>,
}

impl NodeDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }
}

/// 节点异步上报的更新结果，`result_code` 与 `CertUpdateStatus` 的取值一致
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub sn: String,
    pub result_code: i64,
    #[serde(default)]
    pub desc: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_message_omits_force() {
        let payload = CertUpdatePayload::new(CertKind::EdgeCa, "-----BEGIN CERTIFICATE-----").forced();
        let message = payload.node_message().unwrap();
        assert_eq!(
            message,
            r#"{"certType":"EdgeCa","caContent":"-----BEGIN CERTIFICATE-----"}"#
        );

        let decoded: CertUpdatePayload = serde_json::from_str(&message).unwrap();
        assert!(!decoded.force);
        assert_eq!(decoded.kind().unwrap(), CertKind::EdgeCa);
    }

    #[test]
    fn test_service_payload_carries_issuer() {
        let payload = CertUpdatePayload::new(CertKind::EdgeSvc, "root").with_issuer("issuer");
        let value: serde_json::Value = serde_json::from_str(&payload.node_message().unwrap()).unwrap();
        assert_eq!(value["issuerContent"], "issuer");
        assert!(CertUpdatePayload::new(CertKind::EdgeSvc, "")
            .with_issuer("x")
            .kind()
            .is_ok());
    }

    #[test]
    fn test_unknown_cert_type() {
        let payload = CertUpdatePayload {
            cert_type: "Hub".to_string(),
            ..Default::default()
        };
        assert!(matches!(payload.kind(), Err(FleetError::Validation(_))));
    }
}
