use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::{FleetError, FleetResult};

/// 根证书主题
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RootSubjectConfig {
    pub country: String,
    pub organization: String,
    pub organizational_unit: String,
    pub common_name_prefix: String,
}

impl Default for RootSubjectConfig {
    fn default() -> Self {
        Self {
            country: "CN".to_string(),
            organization: "EdgeFleet".to_string(),
            organizational_unit: "EdgeFleet CA".to_string(),
            common_name_prefix: "EdgeFleet-Root".to_string(),
        }
    }
}

/// 私钥落盘加密使用的密钥管理配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KmsSubConfig {
    pub primary_keystore: String,
    pub standby_keystore: String,
    #[serde(default)]
    pub algorithm_id: u32,
    #[serde(default)]
    pub domain_id: u32,
}

impl Default for KmsSubConfig {
    fn default() -> Self {
        Self {
            primary_keystore: "keystore/master.ks".to_string(),
            standby_keystore: "keystore/backup.ks".to_string(),
            algorithm_id: 0,
            domain_id: 0,
        }
    }
}

impl ConfigValidator for KmsSubConfig {
    fn validate(&self) -> FleetResult<()> {
        ValidationUtils::validate_not_empty(&self.primary_keystore, "certs.kms.primary_keystore")?;
        ValidationUtils::validate_not_empty(&self.standby_keystore, "certs.kms.standby_keystore")?;
        if self.primary_keystore == self.standby_keystore {
            return Err(FleetError::Validation(
                "certs.kms 主备密钥库路径不能相同".to_string(),
            ));
        }
        Ok(())
    }
}

/// 证书过期扫描配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpiryScanConfig {
    pub interval_days: u32,
    pub warning_days: u32,
}

impl Default for ExpiryScanConfig {
    fn default() -> Self {
        Self {
            interval_days: 1,
            warning_days: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CertsConfig {
    #[serde(default)]
    pub root_subject: RootSubjectConfig,
    #[serde(default)]
    pub kms: KmsSubConfig,
    #[serde(default)]
    pub root_ca_path: String,
    #[serde(default)]
    pub root_key_path: String,
    #[serde(default)]
    pub expiry: ExpiryScanConfig,
}

impl ConfigValidator for CertsConfig {
    fn validate(&self) -> FleetResult<()> {
        ValidationUtils::validate_not_empty(&self.root_subject.common_name_prefix, "certs.root_subject.common_name_prefix")?;
        if self.root_subject.country.len() != 2 {
            return Err(FleetError::Validation(
                "certs.root_subject.country 必须是两位国家代码".to_string(),
            ));
        }
        self.kms.validate()?;
        ValidationUtils::validate_range(self.expiry.interval_days, 1, 365, "certs.expiry.interval_days")?;
        ValidationUtils::validate_range(self.expiry.warning_days, 1, 3650, "certs.expiry.warning_days")?;
        Ok(())
    }
}

/// 静态登记的边缘节点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeNodeConfig {
    pub sn: String,
    #[serde(default)]
    pub ip: String,
}

/// 证书轮换协调器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertUpdateConfig {
    /// 集群节点数量上限
    pub max_node: usize,
    /// 相邻两次节点通知之间的间隔（毫秒）
    pub notify_interval_ms: u64,
    /// 失败节点重新下发的检查周期（秒）
    pub failed_check_interval_seconds: u64,
    /// 退出条件检查周期（秒）
    pub exit_check_interval_seconds: u64,
    /// 业务证书重新下发前需要等待的超时时间（秒）
    pub update_timeout_seconds: u64,
    /// 本地信任库目录，轮换时写入新的 CA 证书
    #[serde(default = "default_trust_store_dir")]
    pub trust_store_dir: String,
    #[serde(default)]
    pub nodes: Vec<EdgeNodeConfig>,
}

fn default_trust_store_dir() -> String {
    "/var/lib/edgefleet/trust".to_string()
}

impl Default for CertUpdateConfig {
    fn default() -> Self {
        Self {
            max_node: 1024,
            notify_interval_ms: 3000,
            failed_check_interval_seconds: 15 * 60,
            exit_check_interval_seconds: 3600,
            update_timeout_seconds: 10 * 60,
            trust_store_dir: default_trust_store_dir(),
            nodes: Vec::new(),
        }
    }
}

impl ConfigValidator for CertUpdateConfig {
    fn validate(&self) -> FleetResult<()> {
        ValidationUtils::validate_range(self.max_node, 1, 100_000, "cert_update.max_node")?;
        ValidationUtils::validate_range(self.notify_interval_ms, 1, 60_000, "cert_update.notify_interval_ms")?;
        ValidationUtils::validate_range(
            self.failed_check_interval_seconds,
            1,
            86400,
            "cert_update.failed_check_interval_seconds",
        )?;
        ValidationUtils::validate_range(
            self.exit_check_interval_seconds,
            1,
            86400,
            "cert_update.exit_check_interval_seconds",
        )?;
        ValidationUtils::validate_range(
            self.update_timeout_seconds,
            1,
            86400,
            "cert_update.update_timeout_seconds",
        )?;
        ValidationUtils::validate_not_empty(&self.trust_store_dir, "cert_update.trust_store_dir")?;
        if self.nodes.len() > self.max_node {
            return Err(FleetError::Configuration(format!(
                "cert_update.nodes 数量 {} 超过 max_node {}",
                self.nodes.len(),
                self.max_node
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            ValidationUtils::validate_not_empty(&node.sn, "cert_update.nodes.sn")?;
            if !seen.insert(node.sn.as_str()) {
                return Err(FleetError::Configuration(format!("重复的节点序列号: {}", node.sn)));
            }
        }
        Ok(())
    }
}
