//! 证书到期巡检

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use openssl::x509::X509Ref;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{CertError, CertResult};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertValidity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryWarning {
    /// 当前时间不在有效期内
    OutOfValidity { fingerprint: String, is_ca: bool },
    /// 剩余天数低于告警阈值
    ExpiringSoon {
        fingerprint: String,
        is_ca: bool,
        days_left: i64,
    },
}

/// 按 SHA-256 指纹登记的证书有效期
#[derive(Debug, Default)]
pub struct CertExpiryRegistry {
    certs: RwLock<HashMap<String, CertValidity>>,
}

pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

fn to_utc(timestamp: i64) -> CertResult<DateTime<Utc>> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| CertError::Parse(format!("证书时间超出范围: {timestamp}")))
}

impl CertExpiryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记证书，返回其指纹
    pub fn add_cert(&self, cert: &X509Ref) -> CertResult<String> {
        let der = cert.to_der()?;
        let (_, parsed) = X509Certificate::from_der(&der).map_err(|e| CertError::Parse(e.to_string()))?;
        let validity = CertValidity {
            not_before: to_utc(parsed.validity().not_before.timestamp())?,
            not_after: to_utc(parsed.validity().not_after.timestamp())?,
            is_ca: parsed.is_ca(),
        };
        let fingerprint = fingerprint(&der);
        self.certs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fingerprint.clone(), validity);
        debug!(fingerprint = %fingerprint, "证书已登记到期巡检");
        Ok(fingerprint)
    }

    pub fn remove_cert(&self, fingerprint: &str) -> bool {
        self.certs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(fingerprint)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.certs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 检查全部证书，返回需要告警的条目
    pub fn scan(&self, now: DateTime<Utc>, warning_days: u32) -> Vec<ExpiryWarning> {
        let certs = self.certs.read().unwrap_or_else(PoisonError::into_inner);
        let mut warnings = Vec::new();
        for (fingerprint, validity) in certs.iter() {
            if now < validity.not_before || now > validity.not_after {
                warn!(fingerprint = %fingerprint, is_ca = validity.is_ca, "证书不在有效期内");
                warnings.push(ExpiryWarning::OutOfValidity {
                    fingerprint: fingerprint.clone(),
                    is_ca: validity.is_ca,
                });
            }
            let days_left = (validity.not_after - now).num_days();
            if (0..i64::from(warning_days)).contains(&days_left) {
                warn!(
                    fingerprint = %fingerprint,
                    is_ca = validity.is_ca,
                    days_left,
                    "证书即将过期"
                );
                warnings.push(ExpiryWarning::ExpiringSoon {
                    fingerprint: fingerprint.clone(),
                    is_ca: validity.is_ca,
                    days_left,
                });
            }
        }
        warnings
    }

    /// 每隔 `interval_days` 天巡检一次，直到取消
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval_days: u32,
        warning_days: u32,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let period = Duration::from_secs(u64::from(interval_days.max(1)) * SECONDS_PER_DAY);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            info!("证书到期巡检已启动，间隔 {} 天", interval_days);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("证书到期巡检已停止");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.scan(Utc::now(), warning_days);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{create_root_ca, RootCaSubject};
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_scan_reports_expiring_and_out_of_window() {
        let registry = CertExpiryRegistry::new();
        let root = create_root_ca(&RootCaSubject::default()).unwrap().parse().unwrap();
        let fp = registry.add_cert(&root.cert).unwrap();
        assert_eq!(fp, fingerprint(&root.cert.to_der().unwrap()));
        assert_eq!(registry.len(), 1);

        assert!(registry.scan(Utc::now(), 90).is_empty());

        let not_after = {
            let der = root.cert.to_der().unwrap();
            let (_, parsed) = X509Certificate::from_der(&der).unwrap();
            to_utc(parsed.validity().not_after.timestamp()).unwrap()
        };
        let warnings = registry.scan(not_after - ChronoDuration::days(10), 90);
        assert_eq!(
            warnings,
            vec![ExpiryWarning::ExpiringSoon {
                fingerprint: fp.clone(),
                is_ca: true,
                days_left: 10,
            }]
        );

        let warnings = registry.scan(not_after + ChronoDuration::days(1), 90);
        assert_eq!(
            warnings,
            vec![ExpiryWarning::OutOfValidity {
                fingerprint: fp.clone(),
                is_ca: true,
            }]
        );

        assert!(registry.remove_cert(&fp));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_scan_stops_on_cancel() {
        let registry = Arc::new(CertExpiryRegistry::new());
        let cancel = CancellationToken::new();
        let handle = registry.clone().spawn_periodic(1, 30, cancel.clone());

        tokio::time::advance(Duration::from_secs(SECONDS_PER_DAY + 1)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
