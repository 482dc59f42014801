use edgefleet_core::FleetError;
use thiserror::Error;

/// 证书与密钥相关错误
#[derive(Debug, Error)]
pub enum CertError {
    #[error("OpenSSL错误: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("DER编码错误: {0}")]
    Der(#[from] der::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("PEM格式错误: {0}")]
    Pem(String),

    #[error("证书解析失败: {0}")]
    Parse(String),

    #[error("证书校验失败: {0}")]
    Invalid(String),

    #[error("证书已吊销: {serial}")]
    Revoked { serial: String },

    #[error("吊销列表无效: {0}")]
    Crl(String),

    #[error("密钥管理错误: {0}")]
    Kms(String),

    #[error("备份恢复失败: {0}")]
    Backup(String),
}

pub type CertResult<T> = std::result::Result<T, CertError>;

impl From<CertError> for FleetError {
    fn from(err: CertError) -> Self {
        FleetError::Cert(err.to_string())
    }
}
