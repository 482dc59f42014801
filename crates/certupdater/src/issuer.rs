//! 业务证书签发与轮换载荷

use edgefleet_certs::pem::parse_cert_chain;
use edgefleet_certs::{sign_service_cert, CaPairInfo, CaPairInfoWithPem, CertError, CertResult};
use edgefleet_domain::CertKind;

use crate::payload::CertUpdatePayload;

/// 持有签发 CA 的业务证书签发器
#[derive(Debug, Clone)]
pub struct ServiceCertIssuer {
    ca: CaPairInfo,
    /// 下发给节点的签发链，缺省为 CA 证书本身
    chain_pem: Vec<u8>,
    validity_days: u32,
}

impl ServiceCertIssuer {
    pub fn new(ca: CaPairInfo, validity_days: u32) -> CertResult<Self> {
        let chain_pem = ca.cert.to_pem()?;
        Ok(Self {
            ca,
            chain_pem,
            validity_days,
        })
    }

    pub fn from_pem(pair: &CaPairInfoWithPem, validity_days: u32) -> CertResult<Self> {
        let mut issuer = Self::new(pair.parse()?, validity_days)?;
        issuer.chain_pem = pair.cert_pem.clone();
        Ok(issuer)
    }

    /// 替换签发链，链中至少包含一张证书
    pub fn with_chain(mut self, chain_pem: Vec<u8>) -> CertResult<Self> {
        if parse_cert_chain(&chain_pem)?.is_empty() {
            return Err(CertError::Invalid("签发链为空".to_string()));
        }
        self.chain_pem = chain_pem;
        Ok(self)
    }

    pub fn sign(&self, csr_pem: &[u8]) -> CertResult<Vec<u8>> {
        sign_service_cert(csr_pem, &self.ca, self.validity_days)
    }

    /// 业务证书轮换的载荷
    pub fn payload(&self) -> CertResult<CertUpdatePayload> {
        let ca_content = String::from_utf8(self.ca.cert.to_pem()?)
            .map_err(|e| CertError::Parse(e.to_string()))?;
        let issuer_content =
            String::from_utf8(self.chain_pem.clone()).map_err(|e| CertError::Parse(e.to_string()))?;
        Ok(CertUpdatePayload::new(CertKind::EdgeSvc, ca_content).with_issuer(issuer_content))
    }
}
