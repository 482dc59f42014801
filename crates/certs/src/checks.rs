//! 证书扩展、签名算法与密钥强度检查

use chrono::{DateTime, Utc};
use openssl::pkey::Id;
use openssl::x509::X509;
use tracing::warn;
use x509_parser::prelude::{FromDer, X509Certificate, X509Version};

use crate::error::{CertError, CertResult};

pub const MIN_RSA_BITS: u32 = 3072;
pub const MIN_RSA_BITS_COMPAT: u32 = 2048;
pub const MIN_EC_BITS: u32 = 256;

/// MD2/MD5/SHA-1 系列签名算法
const WEAK_SIGNATURE_OIDS: [&str; 6] = [
    "1.2.840.113549.1.1.2",
    "1.2.840.113549.1.1.4",
    "1.2.840.113549.1.1.5",
    "1.2.840.10040.4.3",
    "1.2.840.10045.4.1",
    "1.3.14.3.2.29",
];

fn parse(der: &[u8]) -> CertResult<X509Certificate<'_>> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| CertError::Parse(e.to_string()))
}

/// 检查证书版本、CA 扩展、签名算法与公钥长度
pub fn check_cert_extensions(der: &[u8], ignore_length: bool) -> CertResult<()> {
    let cert = parse(der)?;
    if cert.version() != X509Version::V3 {
        return Err(CertError::Invalid("证书必须为 X509 v3".to_string()));
    }
    if cert.is_ca() {
        check_ca_usage(&cert)?;
    }
    check_signature_algorithm(&cert)?;
    check_key_strength(der, ignore_length)
}

/// CA 证书必须带有效的基本约束与证书签名用途
pub fn check_ca_extensions(der: &[u8]) -> CertResult<()> {
    let cert = parse(der)?;
    if cert.version() != X509Version::V3 {
        return Err(CertError::Invalid("CA证书必须为 X509 v3".to_string()));
    }
    check_ca_usage(&cert)
}

fn check_ca_usage(cert: &X509Certificate<'_>) -> CertResult<()> {
    let constraints = cert
        .basic_constraints()
        .map_err(|e| CertError::Parse(e.to_string()))?;
    if !constraints.is_some_and(|ext| ext.value.ca) {
        return Err(CertError::Invalid("CA证书缺少有效的基本约束".to_string()));
    }
    let usage = cert.key_usage().map_err(|e| CertError::Parse(e.to_string()))?;
    if !usage.is_some_and(|ext| ext.value.key_cert_sign()) {
        return Err(CertError::Invalid("CA证书缺少证书签名用途".to_string()));
    }
    Ok(())
}

fn check_signature_algorithm(cert: &X509Certificate<'_>) -> CertResult<()> {
    let oid = cert.signature_algorithm.algorithm.to_id_string();
    if WEAK_SIGNATURE_OIDS.contains(&oid.as_str()) {
        return Err(CertError::Invalid(format!("不安全的签名算法: {oid}")));
    }
    Ok(())
}

fn check_key_strength(der: &[u8], ignore_length: bool) -> CertResult<()> {
    let key = X509::from_der(der)?.public_key()?;
    let bits = key.bits();
    match key.id() {
        Id::RSA if bits >= MIN_RSA_BITS => Ok(()),
        Id::RSA if ignore_length && bits >= MIN_RSA_BITS_COMPAT => {
            warn!("RSA 公钥长度 {} 低于推荐值 {}", bits, MIN_RSA_BITS);
            Ok(())
        }
        Id::RSA => Err(CertError::Invalid(format!("RSA 公钥长度不足: {bits}"))),
        Id::EC if bits >= MIN_EC_BITS => Ok(()),
        Id::EC => Err(CertError::Invalid(format!("EC 公钥长度不足: {bits}"))),
        other => Err(CertError::Invalid(format!("不支持的公钥类型: {:?}", other))),
    }
}

/// 检查 `now` 是否处于证书有效期内
pub fn check_validity(der: &[u8], now: DateTime<Utc>) -> CertResult<()> {
    let cert = parse(der)?;
    let validity = cert.validity();
    let now = now.timestamp();
    if now < validity.not_before.timestamp() || now > validity.not_after.timestamp() {
        return Err(CertError::Invalid("证书不在有效期内".to_string()));
    }
    Ok(())
}

/// 检查作为信任锚的 CA 证书链
///
/// 每张证书都要满足 CA 扩展与算法要求，并由链中某张证书签发；链中至少有一张自签名根证书。
pub fn check_ca_chain(chain: &[X509], ignore_length: bool) -> CertResult<()> {
    if chain.is_empty() {
        return Err(CertError::Invalid("CA证书链为空".to_string()));
    }
    let now = Utc::now();
    let mut has_root = false;
    for cert in chain {
        let der = cert.to_der()?;
        check_ca_extensions(&der)?;
        check_cert_extensions(&der, ignore_length)?;
        check_validity(&der, now)?;

        let issued_by_chain = chain.iter().any(|issuer| {
            issuer
                .public_key()
                .and_then(|key| cert.verify(&key))
                .unwrap_or(false)
        });
        if !issued_by_chain {
            return Err(CertError::Invalid("CA证书不是由链中的证书签发".to_string()));
        }
        has_root |= cert.public_key().and_then(|key| cert.verify(&key)).unwrap_or(false);
    }
    if !has_root {
        return Err(CertError::Invalid("CA证书链中没有根证书".to_string()));
    }
    Ok(())
}
