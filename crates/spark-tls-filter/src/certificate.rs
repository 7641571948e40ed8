use std::fmt;

use der::Decode;
use tracing::info;

use crate::{engine::RawCertificate, error::TlsError};

/// 解析后的 X.509 证书，同时保留原始 DER。
#[derive(Clone)]
pub struct X509Certificate {
    der: Vec<u8>,
    parsed: x509_cert::Certificate,
}

impl X509Certificate {
    pub fn from_der(der: &[u8]) -> Result<Self, TlsError> {
        let parsed = x509_cert::Certificate::from_der(der)
            .map_err(|err| TlsError::CertificateConversion(err.to_string()))?;
        Ok(Self {
            der: der.to_vec(),
            parsed,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn certificate(&self) -> &x509_cert::Certificate {
        &self.parsed
    }

    /// 主题名称的 RFC 4514 字符串形式。
    pub fn subject(&self) -> String {
        self.parsed.tbs_certificate.subject.to_string()
    }

    pub fn issuer(&self) -> String {
        self.parsed.tbs_certificate.issuer.to_string()
    }
}

impl fmt::Debug for X509Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509Certificate")
            .field("subject", &self.subject())
            .field("der_len", &self.der.len())
            .finish()
    }
}

/// 把引擎返回的证书链整体转换为 X.509 形式。
///
/// 任一证书转换失败即视为“没有可用证书链”：记录日志后返回 `None`，不向上报错。
pub fn convert_chain(raw: &[RawCertificate]) -> Option<Vec<X509Certificate>> {
    let mut chain = Vec::with_capacity(raw.len());
    for certificate in raw {
        match X509Certificate::from_der(certificate.as_der()) {
            Ok(converted) => chain.push(converted),
            Err(err) => {
                info!(target: "spark::tls", error = %err, "Error translating cert");
                return None;
            }
        }
    }
    Some(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_failure_drops_whole_chain() {
        let raw = vec![RawCertificate(vec![0x30, 0x03, 0x02, 0x01])];
        assert!(convert_chain(&raw).is_none());
    }

    #[test]
    fn self_signed_certificate_round_trips() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .expect("生成自签名证书");
        let der = certified.cert.der().to_vec();
        let chain = convert_chain(&[RawCertificate(der.clone())]).expect("证书可解析");
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].der(), der.as_slice());
    }
}
