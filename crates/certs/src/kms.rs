//! 私钥落盘加密
//!
//! 根密钥（32 字节）保存在主密钥库文件中并镜像到备密钥库，主库不可读时使用备库并回写主库。
//! 密文格式：`"EFK1" | domain_id(u32, 大端) | nonce(12) | tag(16) | 密文`。

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use edgefleet_core::config::KmsSubConfig;
use edgefleet_core::fs::{make_sure_parent, write_with_mode, MODE_600, MODE_DIR_SECRET};
use openssl::rand::rand_bytes;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{CertError, CertResult};

pub const BLOB_MAGIC: &[u8; 4] = b"EFK1";
pub const ALGORITHM_AES_256_GCM: u32 = 0;
const ROOT_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = BLOB_MAGIC.len() + 4 + NONCE_LEN + TAG_LEN;

/// 密钥管理服务
pub trait KeyManager: Send + Sync {
    fn encrypt(&self, plain: &[u8], config: &KmsSubConfig) -> CertResult<Vec<u8>>;
    fn decrypt(&self, blob: &[u8], config: &KmsSubConfig) -> CertResult<Zeroizing<Vec<u8>>>;
}

/// 基于本地密钥库文件的 AES-256-GCM 实现
#[derive(Debug, Default, Clone, Copy)]
pub struct FileKeyManager;

impl FileKeyManager {
    fn root_key(&self, config: &KmsSubConfig) -> CertResult<Zeroizing<Vec<u8>>> {
        let primary = Path::new(&config.primary_keystore);
        let standby = Path::new(&config.standby_keystore);

        match (read_root_key(primary), read_root_key(standby)) {
            (Some(key), standby_key) => {
                if standby_key.as_ref().map(|s| s.as_slice()) != Some(key.as_slice()) {
                    if let Err(e) = store_root_key(standby, &key) {
                        warn!("同步备密钥库失败 {}: {}", standby.display(), e);
                    }
                }
                Ok(key)
            }
            (None, Some(key)) => {
                warn!("主密钥库不可用，使用备密钥库: {}", standby.display());
                if let Err(e) = store_root_key(primary, &key) {
                    warn!("恢复主密钥库失败 {}: {}", primary.display(), e);
                }
                Ok(key)
            }
            (None, None) => {
                if primary.exists() || standby.exists() {
                    return Err(CertError::Kms("主备密钥库均已损坏".to_string()));
                }
                let mut key = Zeroizing::new(vec![0u8; ROOT_KEY_LEN]);
                rand_bytes(&mut key)?;
                store_root_key(primary, &key)?;
                store_root_key(standby, &key)?;
                info!("已创建新的根密钥: {}", primary.display());
                Ok(key)
            }
        }
    }
}

fn read_root_key(path: &Path) -> Option<Zeroizing<Vec<u8>>> {
    let key = Zeroizing::new(fs::read(path).ok()?);
    (key.len() == ROOT_KEY_LEN).then_some(key)
}

fn store_root_key(path: &Path, key: &[u8]) -> CertResult<()> {
    make_sure_parent(path, MODE_DIR_SECRET)?;
    write_with_mode(path, key, MODE_600)?;
    Ok(())
}

fn check_algorithm(config: &KmsSubConfig) -> CertResult<()> {
    if config.algorithm_id != ALGORITHM_AES_256_GCM {
        return Err(CertError::Kms(format!(
            "不支持的加密算法: {}",
            config.algorithm_id
        )));
    }
    Ok(())
}

fn aad(domain_id: u32) -> [u8; 8] {
    let mut aad = [0u8; 8];
    aad[..4].copy_from_slice(BLOB_MAGIC);
    aad[4..].copy_from_slice(&domain_id.to_be_bytes());
    aad
}

impl KeyManager for FileKeyManager {
    fn encrypt(&self, plain: &[u8], config: &KmsSubConfig) -> CertResult<Vec<u8>> {
        check_algorithm(config)?;
        let key = self.root_key(config)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand_bytes(&mut nonce)?;
        let mut tag = [0u8; TAG_LEN];
        let aad = aad(config.domain_id);
        let ciphertext = encrypt_aead(Cipher::aes_256_gcm(), &key, Some(&nonce), &aad, plain, &mut tag)?;

        let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        blob.extend_from_slice(&aad);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&tag);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt(&self, blob: &[u8], config: &KmsSubConfig) -> CertResult<Zeroizing<Vec<u8>>> {
        check_algorithm(config)?;
        if blob.len() < HEADER_LEN || &blob[..4] != BLOB_MAGIC {
            return Err(CertError::Kms("密文格式无效".to_string()));
        }
        let (header, ciphertext) = blob.split_at(HEADER_LEN);
        let domain_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if domain_id != config.domain_id {
            return Err(CertError::Kms(format!(
                "密文所属域 {domain_id} 与配置 {} 不一致",
                config.domain_id
            )));
        }
        let nonce = &header[8..8 + NONCE_LEN];
        let tag = &header[8 + NONCE_LEN..];

        let key = self.root_key(config)?;
        let plain = decrypt_aead(
            Cipher::aes_256_gcm(),
            &key,
            Some(nonce),
            &header[..8],
            ciphertext,
            tag,
        )
        .map_err(|_| CertError::Kms("解密失败，密文或密钥不匹配".to_string()))?;
        Ok(Zeroizing::new(plain))
    }
}

/// 密钥管理服务与其配置的组合
#[derive(Clone)]
pub struct KmsHandle {
    manager: Arc<dyn KeyManager>,
    config: KmsSubConfig,
}

impl KmsHandle {
    pub fn new(manager: Arc<dyn KeyManager>, config: KmsSubConfig) -> Self {
        Self { manager, config }
    }

    pub fn file(config: KmsSubConfig) -> Self {
        Self::new(Arc::new(FileKeyManager), config)
    }

    pub fn config(&self) -> &KmsSubConfig {
        &self.config
    }

    pub fn encrypt(&self, plain: &[u8]) -> CertResult<Vec<u8>> {
        self.manager.encrypt(plain, &self.config)
    }

    pub fn decrypt(&self, blob: &[u8]) -> CertResult<Zeroizing<Vec<u8>>> {
        self.manager.decrypt(blob, &self.config)
    }
}

impl fmt::Debug for KmsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmsHandle")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
