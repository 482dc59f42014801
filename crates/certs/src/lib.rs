//! 证书与密钥生命周期：签发、加密落盘、备份恢复、吊销与到期检查、TLS 配置

pub mod backup;
pub mod checks;
pub mod crl;
pub mod error;
pub mod expiry;
pub mod issue;
pub mod kms;
pub mod loader;
pub mod pem;
pub mod tls;

pub use crl::{sign_crl, CrlChecker};
pub use error::{CertError, CertResult};
pub use expiry::{CertExpiryRegistry, CertValidity, ExpiryWarning};
pub use issue::{create_csr, create_root_ca, sign_service_cert, CertSan, RootCaSubject, RootCertManager};
pub use kms::{FileKeyManager, KeyManager, KmsHandle};
pub use loader::{CaPairInfo, CaPairInfoWithPem};
pub use tls::{build_acceptor, build_connector, connect_configuration, TlsCertInfo, TlsContext};
