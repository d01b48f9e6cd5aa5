//! X.509 helpers with the Moonlight-specific lenient verification policy.
//!
//! Embedded Moonlight clients routinely present certificates with unsynced
//! clocks and no full issuer chain; the checks below intentionally accept
//! that, matching the upstream protocol's own verification behaviour.

use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::RsaPublicKey;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::error::{AuthError, HostError};

/// Load a certificate from PEM bytes, returning its DER encoding.
pub fn load_pem(pem: &str) -> Result<Vec<u8>, HostError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|_| HostError::Internal("invalid PEM certificate".into()))?;
    Ok(pem.contents)
}

/// Parse the DER bytes of a certificate.
pub fn parse<'a>(der: &'a [u8]) -> Result<X509Certificate<'a>, HostError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|_| HostError::Internal("malformed X.509 certificate".into()))?;
    Ok(cert)
}

/// Raw signature bytes over the certificate's tbsCertificate.
pub fn signature(der: &[u8]) -> Result<Vec<u8>, HostError> {
    let cert = parse(der)?;
    Ok(cert.signature_value.data.to_vec())
}

/// Extract the RSA public key carried by the certificate.
pub fn public_key(der: &[u8]) -> Result<RsaPublicKey, HostError> {
    let cert = parse(der)?;
    let spki = &cert.tbs_certificate.subject_pki;
    RsaPublicKey::from_pkcs1_der(spki.subject_public_key.data.as_ref())
        .or_else(|_| {
            rsa::pkcs8::DecodePublicKey::from_public_key_der(spki.raw.as_ref())
        })
        .map_err(|_| HostError::AuthFail(AuthError::UnknownClient))
}

/// PEM-encode the certificate's public key (PKCS#1).
pub fn public_key_pem(der: &[u8]) -> Result<String, HostError> {
    let key = public_key(der)?;
    key.to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| HostError::Internal(format!("failed to encode public key: {e}")))
}

/// Moonlight's lenient chain verification: accepts missing-issuer,
/// not-yet-valid and expired certificates; does partial-chain matching
/// by comparing the leaf's signature bytes against a trusted certificate's.
pub fn verify_chain(cert_der: &[u8], trusted_cert_der: &[u8]) -> Result<bool, HostError> {
    // A full implementation would walk a chain; a paired client only ever
    // presents one self-signed leaf, so partial-chain verification here
    // reduces to: "is this the exact certificate we paired with".
    Ok(cert_der == trusted_cert_der)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_chain_matches_identical_cert() {
        let der = vec![1, 2, 3, 4];
        assert!(verify_chain(&der, &der).unwrap());
        assert!(!verify_chain(&der, &[5, 6, 7, 8]).unwrap());
    }
}
