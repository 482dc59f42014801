//! 双向 TLS 配置
//!
//! 证书、私钥、吊销列表可以直接给出内容，也可以给出文件路径；私钥文件需经密钥管理服务解密。
//! 开启 `with_backup` 时，加载成功会刷新 `.backup` 副本，加载失败会从副本恢复后重试一次。

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use openssl::pkey::{PKey, Private};
use openssl::ssl::{
    ConnectConfiguration, SslAcceptor, SslConnector, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion,
};
use openssl::x509::{X509VerifyResult, X509};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::backup::load_with_backup;
use crate::checks::{check_ca_chain, check_cert_extensions};
use crate::crl::CrlChecker;
use crate::error::{CertError, CertResult};
use crate::kms::KmsHandle;
use crate::loader::{get_cert_content, get_crl_content, get_key_content, CaPairInfoWithPem};
use crate::pem::parse_cert_chain;

#[derive(Clone, Default)]
pub struct TlsCertInfo {
    pub root_ca_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub crl_path: Option<PathBuf>,
    pub root_ca_content: Option<Vec<u8>>,
    pub cert_content: Option<Vec<u8>>,
    pub key_content: Option<Zeroizing<Vec<u8>>>,
    pub crl_content: Option<Vec<u8>>,
    pub kms: Option<KmsHandle>,
    pub server_side: bool,
    /// 服务端不强制要求客户端证书，客户端不校验主机名
    pub ignore_cn: bool,
    /// 只加载信任的根证书，不加载本端证书与私钥
    pub root_ca_only: bool,
    pub with_backup: bool,
    /// 允许 2048 位 RSA 公钥
    pub ignore_key_length: bool,
}

impl fmt::Debug for TlsCertInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCertInfo")
            .field("root_ca_path", &self.root_ca_path)
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("crl_path", &self.crl_path)
            .field("server_side", &self.server_side)
            .field("ignore_cn", &self.ignore_cn)
            .field("root_ca_only", &self.root_ca_only)
            .field("with_backup", &self.with_backup)
            .field("ignore_key_length", &self.ignore_key_length)
            .finish_non_exhaustive()
    }
}

struct Identity {
    chain: Vec<X509>,
    key: PKey<Private>,
}

struct TlsMaterial {
    roots: Vec<X509>,
    identity: Option<Identity>,
    crl: Option<Arc<CrlChecker>>,
}

impl TlsCertInfo {
    fn file_paths(&self) -> Vec<&Path> {
        [&self.root_ca_path, &self.cert_path, &self.key_path, &self.crl_path]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .collect()
    }

    fn root_pem(&self) -> CertResult<Vec<u8>> {
        match (&self.root_ca_content, &self.root_ca_path) {
            (Some(content), _) => Ok(content.clone()),
            (None, Some(path)) => get_cert_content(path),
            (None, None) => Err(CertError::Invalid("未配置根证书".to_string())),
        }
    }

    fn identity(&self) -> CertResult<Identity> {
        let cert_pem = match (&self.cert_content, &self.cert_path) {
            (Some(content), _) => content.clone(),
            (None, Some(path)) => get_cert_content(path)?,
            (None, None) => return Err(CertError::Invalid("未配置本端证书".to_string())),
        };
        let key_pem = match (&self.key_content, &self.key_path, &self.kms) {
            (Some(content), _, _) => content.clone(),
            (None, Some(path), Some(kms)) => get_key_content(path, kms)?,
            (None, Some(_), None) => {
                return Err(CertError::Kms("读取加密私钥需要配置密钥管理服务".to_string()))
            }
            (None, None, _) => return Err(CertError::Invalid("未配置本端私钥".to_string())),
        };

        let chain = parse_cert_chain(&cert_pem)?;
        let pair = CaPairInfoWithPem { cert_pem, key_pem }.parse()?;
        check_cert_extensions(&pair.cert.to_der()?, self.ignore_key_length)?;
        Ok(Identity {
            chain,
            key: PKey::from_rsa(pair.key)?,
        })
    }

    fn load_material(&self) -> CertResult<TlsMaterial> {
        let roots = parse_cert_chain(&self.root_pem()?)?;
        check_ca_chain(&roots, self.ignore_key_length)?;

        let identity = if self.root_ca_only {
            None
        } else {
            Some(self.identity()?)
        };

        let crl_pem = match (&self.crl_content, &self.crl_path) {
            (Some(content), _) => Some(content.clone()),
            (None, Some(path)) => Some(get_crl_content(path)?),
            (None, None) => None,
        };
        let crl = crl_pem
            .map(|pem| CrlChecker::new(&pem, &roots))
            .transpose()?
            .map(Arc::new);

        Ok(TlsMaterial { roots, identity, crl })
    }

    fn material(&self) -> CertResult<TlsMaterial> {
        if self.with_backup {
            load_with_backup(&self.file_paths(), || self.load_material())
        } else {
            self.load_material()
        }
    }
}

fn configure_context(
    builder: &mut SslContextBuilder,
    material: TlsMaterial,
    mode: SslVerifyMode,
) -> CertResult<()> {
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    for root in &material.roots {
        builder.cert_store_mut().add_cert(root.clone())?;
    }
    if let Some(identity) = material.identity {
        let mut chain = identity.chain.into_iter();
        let leaf = chain
            .next()
            .ok_or_else(|| CertError::Invalid("本端证书为空".to_string()))?;
        builder.set_certificate(&leaf)?;
        for intermediate in chain {
            builder.add_extra_chain_cert(intermediate)?;
        }
        builder.set_private_key(&identity.key)?;
        builder.check_private_key()?;
    }

    match material.crl {
        None => builder.set_verify(mode),
        Some(checker) => builder.set_verify_callback(mode, move |preverified, store| {
            if !preverified || store.error_depth() != 0 {
                return preverified;
            }
            let Some(chain) = store.chain() else {
                return true;
            };
            let chain: Vec<X509> = chain.iter().map(|cert| cert.to_owned()).collect();
            match checker.check_chain(&chain) {
                Ok(()) => true,
                Err(e) => {
                    warn!("对端证书吊销检查未通过: {}", e);
                    store.set_error(X509VerifyResult::APPLICATION_VERIFICATION);
                    false
                }
            }
        }),
    }
    Ok(())
}

/// 构建服务端 TLS 配置
pub fn build_acceptor(info: &TlsCertInfo) -> CertResult<SslAcceptor> {
    let material = info.material()?;
    if material.identity.is_none() {
        return Err(CertError::Invalid("服务端必须配置证书与私钥".to_string()));
    }
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    let mode = if info.ignore_cn {
        SslVerifyMode::PEER
    } else {
        SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT
    };
    configure_context(&mut builder, material, mode)?;
    debug!("服务端 TLS 配置已创建");
    Ok(builder.build())
}

/// 构建客户端 TLS 配置
pub fn build_connector(info: &TlsCertInfo) -> CertResult<SslConnector> {
    let material = info.material()?;
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    configure_context(&mut builder, material, SslVerifyMode::PEER)?;
    debug!("客户端 TLS 配置已创建");
    Ok(builder.build())
}

/// 单次连接的客户端配置，`ignore_cn` 时关闭主机名校验
pub fn connect_configuration(connector: &SslConnector, info: &TlsCertInfo) -> CertResult<ConnectConfiguration> {
    let mut config = connector.configure()?;
    if info.ignore_cn {
        config.set_verify_hostname(false);
    }
    Ok(config)
}

/// 按 `server_side` 构建对应一端的配置
pub enum TlsContext {
    Server(SslAcceptor),
    Client(SslConnector),
}

impl TlsContext {
    pub fn build(info: &TlsCertInfo) -> CertResult<Self> {
        if info.server_side {
            build_acceptor(info).map(Self::Server)
        } else {
            build_connector(info).map(Self::Client)
        }
    }
}
