//! 根证书与服务证书签发

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Months, Utc};
use edgefleet_core::config::{CertsConfig, RootSubjectConfig};
use der::asn1::OctetString;
use der::oid::AssociatedOid;
use der::Encode;
use openssl::asn1::{Asn1Integer, Asn1Object, Asn1OctetString, Asn1Time};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rand::rand_bytes;
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509Builder, X509Extension, X509Name, X509NameBuilder, X509Req, X509ReqBuilder};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;
use x509_cert::ext::pkix::{AuthorityKeyIdentifier, SubjectKeyIdentifier};
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension, X509CertificationRequest};

use crate::backup::backup_files;
use crate::error::{CertError, CertResult};
use crate::kms::KmsHandle;
use crate::loader::{
    get_cert_pair, get_cert_pair_with_backup, save_cert_with_pem, save_key_with_pem, CaPairInfo,
    CaPairInfoWithPem,
};
use crate::pem::{pem_wrap_cert, pem_wrap_csr};

pub const PRIV_KEY_BITS: u32 = 3072;
pub const ROOT_VALIDITY_MONTHS: u32 = 120;
pub const DEFAULT_SERVICE_VALIDITY_DAYS: u32 = 3650;
const SERIAL_BYTES: usize = 20;

/// 证书主题
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCaSubject {
    pub country: String,
    pub organization: String,
    pub organizational_unit: String,
    pub common_name_prefix: String,
}

impl Default for RootCaSubject {
    fn default() -> Self {
        Self::from(&RootSubjectConfig::default())
    }
}

impl From<&RootSubjectConfig> for RootCaSubject {
    fn from(config: &RootSubjectConfig) -> Self {
        Self {
            country: config.country.clone(),
            organization: config.organization.clone(),
            organizational_unit: config.organizational_unit.clone(),
            common_name_prefix: config.common_name_prefix.clone(),
        }
    }
}

impl RootCaSubject {
    fn to_name(&self) -> CertResult<X509Name> {
        let common_name = format!("{}-{}", self.common_name_prefix, Uuid::new_v4());
        let mut builder = X509NameBuilder::new()?;
        builder.append_entry_by_nid(Nid::COUNTRYNAME, &self.country)?;
        builder.append_entry_by_nid(Nid::ORGANIZATIONNAME, &self.organization)?;
        builder.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, &self.organizational_unit)?;
        builder.append_entry_by_nid(Nid::COMMONNAME, &common_name)?;
        Ok(builder.build())
    }
}

/// 证书请求中携带的主题备用名称
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertSan {
    pub dns_names: Vec<String>,
    pub ip_addrs: Vec<IpAddr>,
}

impl CertSan {
    pub fn is_empty(&self) -> bool {
        self.dns_names.is_empty() && self.ip_addrs.is_empty()
    }

    fn to_extension(&self) -> SubjectAlternativeName {
        let mut ext = SubjectAlternativeName::new();
        for dns in &self.dns_names {
            ext.dns(dns);
        }
        for ip in &self.ip_addrs {
            ext.ip(&ip.to_string());
        }
        ext
    }
}

fn random_serial() -> CertResult<Asn1Integer> {
    let mut bytes = [0u8; SERIAL_BYTES];
    rand_bytes(&mut bytes)?;
    Ok(BigNum::from_slice(&bytes)?.to_asn1_integer()?)
}

fn asn1_time(at: DateTime<Utc>) -> CertResult<Asn1Time> {
    Ok(Asn1Time::from_unix(at.timestamp())?)
}

fn key_id_extension<T: AssociatedOid + Encode>(value: &T) -> CertResult<X509Extension> {
    let object = Asn1Object::from_str(&T::OID.to_string())?;
    let contents = Asn1OctetString::new_from_bytes(&value.to_der()?)?;
    Ok(X509Extension::new_from_der(&object, false, &contents)?)
}

fn subject_key_id(key_id: &[u8]) -> CertResult<X509Extension> {
    key_id_extension(&SubjectKeyIdentifier(OctetString::new(key_id)?))
}

fn authority_key_id(key_id: &[u8]) -> CertResult<X509Extension> {
    key_id_extension(&AuthorityKeyIdentifier {
        key_identifier: Some(OctetString::new(key_id)?),
        authority_cert_issuer: None,
        authority_cert_serial_number: None,
    })
}

/// 生成自签名根证书
pub fn create_root_ca(subject: &RootCaSubject) -> CertResult<CaPairInfoWithPem> {
    build_root_ca(subject)?.to_pem()
}

fn build_root_ca(subject: &RootCaSubject) -> CertResult<CaPairInfo> {
    let key = Rsa::generate(PRIV_KEY_BITS)?;
    let pkey = PKey::from_rsa(key.clone())?;
    let not_before = Utc::now() - Duration::hours(24);
    let not_after = not_before
        .checked_add_months(Months::new(ROOT_VALIDITY_MONTHS))
        .ok_or_else(|| CertError::Invalid("根证书有效期溢出".to_string()))?;
    let name = subject.to_name()?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(&*random_serial()?)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&pkey)?;
    builder.set_not_before(&*asn1_time(not_before)?)?;
    builder.set_not_after(&*asn1_time(not_after)?)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(KeyUsage::new().critical().digital_signature().key_cert_sign().build()?)?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().client_auth().build()?)?;

    let key_id = Sha256::digest(key.public_key_to_der_pkcs1()?);
    builder.append_extension(subject_key_id(&key_id)?)?;
    builder.append_extension(authority_key_id(&key_id)?)?;
    builder.sign(&pkey, MessageDigest::sha256())?;

    Ok(CaPairInfo {
        cert: builder.build(),
        key,
    })
}

/// 生成私钥与证书请求，私钥加密后保存到 `key_path`
pub fn create_csr(key_path: &Path, prefix: &str, kms: &KmsHandle, san: &CertSan) -> CertResult<Vec<u8>> {
    let subject = RootCaSubject {
        common_name_prefix: prefix.to_string(),
        ..RootCaSubject::default()
    };
    let key = Rsa::generate(PRIV_KEY_BITS)?;
    let pkey = PKey::from_rsa(key.clone())?;

    let mut builder = X509ReqBuilder::new()?;
    builder.set_version(0)?;
    builder.set_subject_name(&*subject.to_name()?)?;
    builder.set_pubkey(&pkey)?;
    if !san.is_empty() {
        let ext = san.to_extension().build(&builder.x509v3_context(None))?;
        let mut extensions = Stack::new()?;
        extensions.push(ext)?;
        builder.add_extensions(&extensions)?;
    }
    builder.sign(&pkey, MessageDigest::sha256())?;
    let der = builder.build().to_der()?;

    save_key_with_pem(key_path, &key, kms)?;
    Ok(pem_wrap_csr(&der))
}

fn csr_san(der: &[u8]) -> CertResult<CertSan> {
    let (_, csr) = X509CertificationRequest::from_der(der)
        .map_err(|e| CertError::Parse(format!("解析证书请求失败: {e}")))?;
    let mut san = CertSan::default();
    let Some(extensions) = csr.requested_extensions() else {
        return Ok(san);
    };
    for ext in extensions {
        let ParsedExtension::SubjectAlternativeName(names) = ext else {
            continue;
        };
        for name in &names.general_names {
            match name {
                GeneralName::DNSName(dns) => san.dns_names.push(dns.to_string()),
                GeneralName::IPAddress(bytes) => match ip_from_bytes(bytes) {
                    Some(ip) => san.ip_addrs.push(ip),
                    None => warn!("忽略长度异常的IP备用名称: {} 字节", bytes.len()),
                },
                _ => {}
            }
        }
    }
    Ok(san)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(bytes) {
        return Some(IpAddr::V4(Ipv4Addr::from(v4)));
    }
    <[u8; 16]>::try_from(bytes)
        .ok()
        .map(|v6| IpAddr::V6(Ipv6Addr::from(v6)))
}

/// 用根证书签发服务证书
pub fn sign_service_cert(csr_pem: &[u8], ca: &CaPairInfo, validity_days: u32) -> CertResult<Vec<u8>> {
    let req = X509Req::from_pem(csr_pem).map_err(|e| CertError::Parse(format!("解析证书请求失败: {e}")))?;
    let req_key = req.public_key()?;
    if !req.verify(&req_key)? {
        return Err(CertError::Invalid("证书请求签名校验失败".to_string()));
    }
    let san = csr_san(&req.to_der()?)?;

    let ca_key = PKey::from_rsa(ca.key.clone())?;
    let not_before = Utc::now() - Duration::hours(24);
    let not_after = not_before + Duration::days(i64::from(validity_days));

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(&*random_serial()?)?;
    builder.set_subject_name(req.subject_name())?;
    builder.set_issuer_name(ca.cert.subject_name())?;
    builder.set_pubkey(&req_key)?;
    builder.set_not_before(&*asn1_time(not_before)?)?;
    builder.set_not_after(&*asn1_time(not_after)?)?;
    builder.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().client_auth().build()?)?;
    if !san.is_empty() {
        let ext = san.to_extension().build(&builder.x509v3_context(Some(&ca.cert), None))?;
        builder.append_extension(ext)?;
    }

    let ski = Sha256::digest(req_key.public_key_to_der()?);
    let aki = match ca.cert.subject_key_id() {
        Some(id) => id.as_slice().to_vec(),
        None => Sha256::digest(ca.cert.public_key()?.public_key_to_der()?).to_vec(),
    };
    builder.append_extension(subject_key_id(&ski)?)?;
    builder.append_extension(authority_key_id(&aki)?)?;
    builder.sign(&ca_key, MessageDigest::sha256())?;

    Ok(pem_wrap_cert(&builder.build().to_der()?))
}

/// 根证书管理：生成、加载并用其签发服务证书
#[derive(Debug, Clone)]
pub struct RootCertManager {
    root_ca_path: PathBuf,
    root_key_path: PathBuf,
    subject: RootCaSubject,
    kms: KmsHandle,
    service_validity_days: u32,
}

impl RootCertManager {
    pub fn new(root_ca_path: PathBuf, root_key_path: PathBuf, subject: RootCaSubject, kms: KmsHandle) -> Self {
        Self {
            root_ca_path,
            root_key_path,
            subject,
            kms,
            service_validity_days: DEFAULT_SERVICE_VALIDITY_DAYS,
        }
    }

    pub fn from_config(config: &CertsConfig) -> Self {
        Self::new(
            PathBuf::from(&config.root_ca_path),
            PathBuf::from(&config.root_key_path),
            RootCaSubject::from(&config.root_subject),
            KmsHandle::file(config.kms.clone()),
        )
    }

    pub fn with_service_validity_days(mut self, days: u32) -> Self {
        self.service_validity_days = days;
        self
    }

    pub fn root_ca_path(&self) -> &Path {
        &self.root_ca_path
    }

    pub fn root_key_path(&self) -> &Path {
        &self.root_key_path
    }

    /// 生成新的根证书并保存，覆盖已有文件
    pub fn new_root_ca(&self) -> CertResult<CaPairInfo> {
        let pair = build_root_ca(&self.subject)?;
        save_cert_with_pem(&self.root_ca_path, &pair.cert.to_der()?)?;
        save_key_with_pem(&self.root_key_path, &pair.key, &self.kms)?;
        info!("根证书已生成: {}", self.root_ca_path.display());
        Ok(pair)
    }

    pub fn new_root_ca_with_backup(&self) -> CertResult<CaPairInfo> {
        let pair = self.new_root_ca()?;
        if let Err(e) = backup_files(&[&self.root_ca_path, &self.root_key_path]) {
            warn!("备份根证书失败: {}", e);
        }
        Ok(pair)
    }

    pub fn get_root_ca_pair(&self) -> CertResult<CaPairInfo> {
        get_cert_pair(&self.root_ca_path, &self.root_key_path, &self.kms)
    }

    pub fn get_root_ca_pair_with_backup(&self) -> CertResult<CaPairInfo> {
        get_cert_pair_with_backup(&self.root_ca_path, &self.root_key_path, &self.kms)
    }

    /// 加载根证书，证书与私钥文件都不存在时生成新的根证书
    pub fn load_or_create(&self) -> CertResult<CaPairInfo> {
        if !self.root_ca_path.exists() && !self.root_key_path.exists() {
            return self.new_root_ca_with_backup();
        }
        self.get_root_ca_pair_with_backup()
    }

    pub fn issue_service_cert(&self, csr_pem: &[u8]) -> CertResult<Vec<u8>> {
        let root = self.get_root_ca_pair()?;
        sign_service_cert(csr_pem, &root, self.service_validity_days)
    }

    pub fn issue_service_cert_with_backup(&self, csr_pem: &[u8]) -> CertResult<Vec<u8>> {
        let root = self.get_root_ca_pair_with_backup()?;
        sign_service_cert(csr_pem, &root, self.service_validity_days)
    }
}
