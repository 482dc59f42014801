//! PEM 编解码
//!
//! 解码是严格的：块内不允许出现头部字段，类型不符即报错。

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use openssl::pkey::Private;
use openssl::rsa::Rsa;
use openssl::x509::X509;
use zeroize::Zeroizing;

use crate::error::{CertError, CertResult};

pub const CERT_TYPE: &str = "CERTIFICATE";
pub const CSR_TYPE: &str = "CERTIFICATE REQUEST";
pub const PRIV_KEY_TYPE: &str = "RSA PRIVATE KEY";
pub const CRL_TYPE: &str = "X509 CRL";
/// 单个证书链文件允许的最大证书数量
pub const MAX_CERT_COUNT: usize = 10;
const LINE_LEN: usize = 64;

#[derive(Debug)]
pub struct PemBlock {
    pub label: String,
    pub contents: Zeroizing<Vec<u8>>,
}

pub fn pem_encode(label: &str, der: &[u8]) -> Zeroizing<Vec<u8>> {
    let encoded = Zeroizing::new(STANDARD.encode(der));
    let mut out = Zeroizing::new(Vec::with_capacity(encoded.len() + encoded.len() / LINE_LEN + 64));
    out.extend_from_slice(format!("-----BEGIN {label}-----\n").as_bytes());
    for line in encoded.as_bytes().chunks(LINE_LEN) {
        out.extend_from_slice(line);
        out.push(b'\n');
    }
    out.extend_from_slice(format!("-----END {label}-----\n").as_bytes());
    out
}

/// 解析所有 PEM 块，块以外的内容被忽略
pub fn pem_decode_all(data: &[u8]) -> CertResult<Vec<PemBlock>> {
    let text = std::str::from_utf8(data).map_err(|_| CertError::Pem("内容不是合法文本".to_string()))?;
    let mut blocks = Vec::new();
    let mut current: Option<(String, Zeroizing<String>)> = None;

    for line in text.lines().map(str::trim) {
        match current.as_mut() {
            None => {
                if let Some(label) = line
                    .strip_prefix("-----BEGIN ")
                    .and_then(|rest| rest.strip_suffix("-----"))
                {
                    current = Some((label.to_string(), Zeroizing::new(String::new())));
                }
            }
            Some((label, body)) => {
                if let Some(end) = line
                    .strip_prefix("-----END ")
                    .and_then(|rest| rest.strip_suffix("-----"))
                {
                    if end != label.as_str() {
                        return Err(CertError::Pem(format!("块类型不匹配: {label} / {end}")));
                    }
                    let contents = STANDARD
                        .decode(body.as_bytes())
                        .map_err(|e| CertError::Pem(format!("base64 解码失败: {e}")))?;
                    blocks.push(PemBlock {
                        label: std::mem::take(label),
                        contents: Zeroizing::new(contents),
                    });
                    current = None;
                } else if line.contains(':') {
                    return Err(CertError::Pem("不支持带头部字段的 PEM 块".to_string()));
                } else {
                    body.push_str(line);
                }
            }
        }
    }
    if current.is_some() {
        return Err(CertError::Pem("PEM 块未结束".to_string()));
    }
    Ok(blocks)
}

fn first_block(data: &[u8], label: &str) -> CertResult<PemBlock> {
    let block = pem_decode_all(data)?
        .into_iter()
        .next()
        .ok_or_else(|| CertError::Pem("未找到 PEM 块".to_string()))?;
    if block.label != label {
        return Err(CertError::Pem(format!("期望 {label}，实际为 {}", block.label)));
    }
    Ok(block)
}

pub fn pem_wrap_cert(der: &[u8]) -> Vec<u8> {
    pem_encode(CERT_TYPE, der).to_vec()
}

pub fn pem_wrap_csr(der: &[u8]) -> Vec<u8> {
    pem_encode(CSR_TYPE, der).to_vec()
}

/// PKCS#1 格式的私钥 PEM，中间缓冲区都会被清零
pub fn pem_wrap_priv_key(key: &Rsa<Private>) -> CertResult<Zeroizing<Vec<u8>>> {
    let der = Zeroizing::new(key.private_key_to_der()?);
    Ok(pem_encode(PRIV_KEY_TYPE, &der))
}

pub fn pem_unwrap_priv_key(pem: &[u8]) -> CertResult<Rsa<Private>> {
    let block = first_block(pem, PRIV_KEY_TYPE)?;
    Ok(Rsa::private_key_from_der(&block.contents)?)
}

pub fn pem_unwrap_cert(pem: &[u8]) -> CertResult<X509> {
    let block = first_block(pem, CERT_TYPE)?;
    X509::from_der(&block.contents).map_err(|e| CertError::Parse(e.to_string()))
}

/// 解析证书链，至少包含一个证书且不超过 [`MAX_CERT_COUNT`]
pub fn parse_cert_chain(pem: &[u8]) -> CertResult<Vec<X509>> {
    let blocks = pem_decode_all(pem)?;
    if blocks.is_empty() {
        return Err(CertError::Parse("内容中没有证书".to_string()));
    }
    if blocks.len() > MAX_CERT_COUNT {
        return Err(CertError::Parse(format!(
            "证书数量 {} 超过上限 {MAX_CERT_COUNT}",
            blocks.len()
        )));
    }
    blocks
        .iter()
        .map(|block| {
            if block.label != CERT_TYPE {
                return Err(CertError::Parse(format!("无效的证书类型: {}", block.label)));
            }
            X509::from_der(&block.contents).map_err(|e| CertError::Parse(e.to_string()))
        })
        .collect()
}
