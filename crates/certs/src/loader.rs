//! 证书、私钥与吊销列表的加载和保存

use std::fs;
use std::path::Path;

use edgefleet_core::fs::{make_sure_parent, set_mode, write_with_mode, MODE_400, MODE_600, MODE_DIR_SECRET};
use openssl::pkey::Private;
use openssl::rsa::Rsa;
use openssl::x509::{X509Crl, X509};
use tracing::info;
use zeroize::Zeroizing;

use crate::backup::load_with_backup;
use crate::error::{CertError, CertResult};
use crate::kms::KmsHandle;
use crate::pem::{parse_cert_chain, pem_unwrap_priv_key, pem_wrap_cert, pem_wrap_priv_key};

/// 已解析的证书与私钥
#[derive(Clone)]
pub struct CaPairInfo {
    pub cert: X509,
    pub key: Rsa<Private>,
}

impl CaPairInfo {
    pub fn to_pem(&self) -> CertResult<CaPairInfoWithPem> {
        Ok(CaPairInfoWithPem {
            cert_pem: self.cert.to_pem()?,
            key_pem: pem_wrap_priv_key(&self.key)?,
        })
    }
}

impl std::fmt::Debug for CaPairInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaPairInfo").finish_non_exhaustive()
    }
}

/// PEM 形式的证书与明文私钥，私钥缓冲区在释放时清零
#[derive(Clone)]
pub struct CaPairInfoWithPem {
    pub cert_pem: Vec<u8>,
    pub key_pem: Zeroizing<Vec<u8>>,
}

impl CaPairInfoWithPem {
    pub fn parse(&self) -> CertResult<CaPairInfo> {
        let cert = parse_cert_chain(&self.cert_pem)?
            .into_iter()
            .next()
            .ok_or_else(|| CertError::Parse("证书内容为空".to_string()))?;
        let key = pem_unwrap_priv_key(&self.key_pem)?;
        Ok(CaPairInfo { cert, key })
    }
}

/// 读取证书链并校验格式
pub fn get_cert_content(path: &Path) -> CertResult<Vec<u8>> {
    let content = fs::read(path)
        .map_err(|e| CertError::Parse(format!("读取证书文件 {} 失败: {e}", path.display())))?;
    parse_cert_chain(&content)?;
    Ok(content)
}

/// 读取并解密私钥
pub fn get_key_content(path: &Path, kms: &KmsHandle) -> CertResult<Zeroizing<Vec<u8>>> {
    let blob = fs::read(path)
        .map_err(|e| CertError::Kms(format!("读取私钥文件 {} 失败: {e}", path.display())))?;
    kms.decrypt(&blob)
        .map_err(|e| CertError::Kms(format!("解密私钥 {} 失败: {e}", path.display())))
}

/// 读取吊销列表并校验格式
pub fn get_crl_content(path: &Path) -> CertResult<Vec<u8>> {
    let content = fs::read(path)?;
    X509Crl::from_pem(&content).map_err(|e| CertError::Crl(format!("解析吊销列表失败: {e}")))?;
    Ok(content)
}

pub fn get_cert_pair_for_pem(cert_path: &Path, key_path: &Path, kms: &KmsHandle) -> CertResult<CaPairInfoWithPem> {
    let cert_pem = get_cert_content(cert_path)?;
    let key_pem = get_key_content(key_path, kms)?;
    Ok(CaPairInfoWithPem { cert_pem, key_pem })
}

pub fn get_cert_pair(cert_path: &Path, key_path: &Path, kms: &KmsHandle) -> CertResult<CaPairInfo> {
    get_cert_pair_for_pem(cert_path, key_path, kms)?.parse()
}

pub fn get_cert_content_with_backup(path: &Path) -> CertResult<Vec<u8>> {
    load_with_backup(&[path], || get_cert_content(path))
}

pub fn get_key_content_with_backup(path: &Path, kms: &KmsHandle) -> CertResult<Zeroizing<Vec<u8>>> {
    load_with_backup(&[path], || get_key_content(path, kms))
}

pub fn get_crl_content_with_backup(path: &Path) -> CertResult<Vec<u8>> {
    load_with_backup(&[path], || get_crl_content(path))
}

pub fn get_cert_pair_for_pem_with_backup(
    cert_path: &Path,
    key_path: &Path,
    kms: &KmsHandle,
) -> CertResult<CaPairInfoWithPem> {
    let cert_pem = get_cert_content_with_backup(cert_path)?;
    let key_pem = get_key_content_with_backup(key_path, kms)?;
    Ok(CaPairInfoWithPem { cert_pem, key_pem })
}

pub fn get_cert_pair_with_backup(cert_path: &Path, key_path: &Path, kms: &KmsHandle) -> CertResult<CaPairInfo> {
    load_with_backup(&[cert_path, key_path], || get_cert_pair(cert_path, key_path, kms))
}

/// 以 PEM 保存证书，权限 0400
pub fn save_cert_with_pem(path: &Path, der: &[u8]) -> CertResult<()> {
    make_sure_parent(path, MODE_DIR_SECRET)?;
    write_with_mode(path, &pem_wrap_cert(der), MODE_400)?;
    Ok(())
}

/// 加密后保存私钥：先以 0600 写入，完成后收紧为 0400
pub fn save_key_with_pem(path: &Path, key: &Rsa<Private>, kms: &KmsHandle) -> CertResult<()> {
    let key_pem = pem_wrap_priv_key(key)?;
    let encrypted = kms.encrypt(&key_pem)?;
    make_sure_parent(path, MODE_DIR_SECRET)?;
    write_with_mode(path, &encrypted, MODE_600)?;
    set_mode(path, MODE_400)?;
    info!("私钥已保存: {}", path.display());
    Ok(())
}
