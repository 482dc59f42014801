//! 证书吊销列表的校验与签发

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use der::asn1::{Any, BitString, Uint};
use der::oid::ObjectIdentifier;
use der::{Decode, Encode};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use openssl::x509::{X509Crl, X509Ref, X509};
use tracing::debug;
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::time::Time;
use x509_cert::Version;

use crate::error::{CertError, CertResult};
use crate::loader::CaPairInfo;
use crate::pem::{pem_decode_all, pem_encode, CRL_TYPE};

const SHA256_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");

/// 一组已通过签名与时间窗口校验的吊销列表
pub struct CrlChecker {
    crls: Vec<X509Crl>,
}

impl std::fmt::Debug for CrlChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrlChecker").field("crls", &self.crls.len()).finish()
    }
}

impl CrlChecker {
    /// 解析 PEM 中的全部吊销列表，每个都必须由 `ca_chain` 中某张证书签发且处于有效期内
    pub fn new(crl_pem: &[u8], ca_chain: &[X509]) -> CertResult<Self> {
        let blocks = pem_decode_all(crl_pem)?;
        let mut crls = Vec::with_capacity(blocks.len());
        for block in blocks.iter().filter(|b| b.label == CRL_TYPE) {
            let crl = X509Crl::from_der(&block.contents)
                .map_err(|e| CertError::Crl(format!("解析吊销列表失败: {e}")))?;
            let signed = ca_chain.iter().any(|ca| {
                ca.public_key()
                    .and_then(|key| crl.verify(&key))
                    .unwrap_or(false)
            });
            if !signed {
                return Err(CertError::Crl("吊销列表不是由信任链中的证书签发".to_string()));
            }
            check_update_window(&crl)?;
            crls.push(crl);
        }
        if crls.is_empty() {
            return Err(CertError::Crl("内容中没有吊销列表".to_string()));
        }
        Ok(Self { crls })
    }

    /// 从叶子证书向外逐级检查，签发了吊销列表的证书所签的下一级证书不得被吊销
    pub fn check_chain(&self, chain: &[X509]) -> CertResult<()> {
        for crl in &self.crls {
            for index in 1..chain.len() {
                if !issued_crl(crl, &chain[index]) {
                    continue;
                }
                let serial = chain[index - 1].serial_number().to_bn()?;
                if is_revoked(crl, &serial)? {
                    return Err(CertError::Revoked {
                        serial: serial.to_hex_str()?.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn issued_crl(crl: &X509Crl, cert: &X509Ref) -> bool {
    cert.public_key()
        .and_then(|key| crl.verify(&key))
        .unwrap_or(false)
}

fn is_revoked(crl: &X509Crl, serial: &BigNum) -> CertResult<bool> {
    let Some(revoked) = crl.get_revoked() else {
        return Ok(false);
    };
    for entry in revoked {
        if entry.serial_number().to_bn()? == *serial {
            debug!("证书序列号 {} 已在吊销列表中", serial.to_hex_str()?);
            return Ok(true);
        }
    }
    Ok(false)
}

fn check_update_window(crl: &X509Crl) -> CertResult<()> {
    let now = Asn1Time::days_from_now(0)?;
    if crl.last_update().compare(&now)? == Ordering::Greater {
        return Err(CertError::Crl("吊销列表尚未生效".to_string()));
    }
    match crl.next_update() {
        Some(next) if next.compare(&now)? != Ordering::Less => Ok(()),
        Some(_) => Err(CertError::Crl("吊销列表已过期".to_string())),
        None => Err(CertError::Crl("吊销列表缺少下次更新时间".to_string())),
    }
}

fn crl_time(at: DateTime<Utc>) -> CertResult<Time> {
    Ok(Time::try_from(std::time::SystemTime::from(at))?)
}

/// 用 CA 私钥签发吊销列表，返回 PEM
///
/// 服务运行时只校验外部导入的吊销列表，签发用于离线吊销和测试。
pub fn sign_crl(
    ca: &CaPairInfo,
    revoked_serials: &[BigNum],
    this_update: DateTime<Utc>,
    next_update: DateTime<Utc>,
) -> CertResult<Vec<u8>> {
    let algorithm = AlgorithmIdentifierOwned {
        oid: SHA256_WITH_RSA,
        parameters: Some(Any::null()),
    };
    let revoked = revoked_serials
        .iter()
        .map(|serial| -> CertResult<RevokedCert> {
            Ok(RevokedCert {
                serial_number: SerialNumber::from_der(&Uint::new(&serial.to_vec())?.to_der()?)?,
                revocation_date: crl_time(this_update)?,
                crl_entry_extensions: None,
            })
        })
        .collect::<CertResult<Vec<_>>>()?;
    let tbs = TbsCertList {
        version: Version::V2,
        signature: algorithm.clone(),
        issuer: Name::from_der(&ca.cert.subject_name().to_der()?)?,
        this_update: crl_time(this_update)?,
        next_update: Some(crl_time(next_update)?),
        revoked_certificates: (!revoked.is_empty()).then_some(revoked),
        crl_extensions: None,
    };

    let key = PKey::from_rsa(ca.key.clone())?;
    let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
    signer.update(&tbs.to_der()?)?;
    let signature = BitString::from_bytes(&signer.sign_to_vec()?)?;

    let crl = CertificateList {
        tbs_cert_list: tbs,
        signature_algorithm: algorithm,
        signature,
    };
    Ok(pem_encode(CRL_TYPE, &crl.to_der()?).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{create_root_ca, RootCaSubject};
    use chrono::Duration;

    fn root() -> CaPairInfo {
        create_root_ca(&RootCaSubject::default()).unwrap().parse().unwrap()
    }

    fn serial_of(cert: &X509) -> BigNum {
        cert.serial_number().to_bn().unwrap()
    }

    #[test]
    fn test_signed_crl_parses_and_verifies() {
        let ca = root();
        let now = Utc::now();
        let pem = sign_crl(&ca, &[BigNum::from_u32(0x80).unwrap()], now - Duration::hours(1), now + Duration::days(7)).unwrap();

        let crl = X509Crl::from_pem(&pem).unwrap();
        assert!(crl.verify(&ca.cert.public_key().unwrap()).unwrap());
        let revoked = crl.get_revoked().unwrap();
        assert_eq!(revoked.len(), 1);
        assert_eq!(revoked.get(0).unwrap().serial_number().to_bn().unwrap(), BigNum::from_u32(0x80).unwrap());

        CrlChecker::new(&pem, &[ca.cert.clone()]).unwrap();
    }

    #[test]
    fn test_crl_keeps_full_width_serials() {
        let ca = root();
        let now = Utc::now();
        let wide = || BigNum::from_slice(&[0xff; 20]).unwrap();
        let small = || BigNum::from_u32(1).unwrap();
        let pem = sign_crl(&ca, &[wide(), small()], now - Duration::hours(1), now + Duration::days(1)).unwrap();

        let crl = X509Crl::from_pem(&pem).unwrap();
        assert!(crl.verify(&ca.cert.public_key().unwrap()).unwrap());
        assert_eq!(crl.issuer_name().to_der().unwrap(), ca.cert.subject_name().to_der().unwrap());
        let serials: Vec<BigNum> = crl
            .get_revoked()
            .unwrap()
            .iter()
            .map(|entry| entry.serial_number().to_bn().unwrap())
            .collect();
        assert_eq!(serials, vec![wide(), small()]);
        assert!(is_revoked(&crl, &wide()).unwrap());
    }

    #[test]
    fn test_crl_rejected_for_foreign_ca_or_stale_window() {
        let ca = root();
        let other = root();
        let now = Utc::now();

        let pem = sign_crl(&ca, &[], now - Duration::hours(1), now + Duration::days(1)).unwrap();
        assert!(CrlChecker::new(&pem, &[other.cert.clone()]).is_err());

        let expired = sign_crl(&ca, &[], now - Duration::days(2), now - Duration::days(1)).unwrap();
        assert!(matches!(CrlChecker::new(&expired, &[ca.cert.clone()]), Err(CertError::Crl(_))));

        let future = sign_crl(&ca, &[], now + Duration::days(1), now + Duration::days(2)).unwrap();
        assert!(CrlChecker::new(&future, &[ca.cert.clone()]).is_err());
    }

    #[test]
    fn test_check_chain_detects_revoked_leaf() {
        let ca = root();
        let leaf = root();
        let now = Utc::now();
        let chain = vec![leaf.cert.clone(), ca.cert.clone()];

        let clean = sign_crl(&ca, &[], now - Duration::hours(1), now + Duration::days(1)).unwrap();
        CrlChecker::new(&clean, &[ca.cert.clone()]).unwrap().check_chain(&chain).unwrap();

        let revoking = sign_crl(&ca, &[serial_of(&leaf.cert)], now - Duration::hours(1), now + Duration::days(1)).unwrap();
        let checker = CrlChecker::new(&revoking, &[ca.cert.clone()]).unwrap();
        assert!(matches!(checker.check_chain(&chain), Err(CertError::Revoked { .. })));

        // 吊销列表只对其签发者的下一级证书生效
        checker.check_chain(&[leaf.cert.clone()]).unwrap();
        checker.check_chain(&[ca.cert.clone(), leaf.cert.clone()]).unwrap();
    }
}
