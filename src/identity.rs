//! Host identity: a 2048-bit RSA key and a self-signed X.509 certificate,
//! persisted as PEM files next to the TOML config and regenerated on
//! first run if absent.

use std::path::{Path, PathBuf};

use pkcs8::EncodePrivateKey;
use rand::rngs::OsRng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rsa::RsaPrivateKey;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::error::HostError;
use crate::pairing::HostIdentity;

const RSA_KEY_BITS: usize = 2048;
const VALIDITY_YEARS: i64 = 20;

pub struct IdentityPaths {
    pub cert_pem: PathBuf,
    pub key_pem: PathBuf,
}

/// Load the host identity from `paths`, generating and persisting a fresh
/// RSA keypair + self-signed certificate if either file is missing.
pub fn load_or_generate(paths: &IdentityPaths) -> Result<HostIdentity, HostError> {
    if paths.cert_pem.exists() && paths.key_pem.exists() {
        let cert_pem = std::fs::read_to_string(&paths.cert_pem).map_err(HostError::Io)?;
        let private_key_pem = std::fs::read_to_string(&paths.key_pem).map_err(HostError::Io)?;
        let cert_der = crate::crypto::x509::load_pem(&cert_pem)?;
        return Ok(HostIdentity {
            cert_pem,
            cert_der,
            private_key_pem,
        });
    }

    warn!("no host identity found, generating a fresh RSA-2048 key and self-signed certificate");
    let identity = generate()?;
    write_pem(&paths.key_pem, &identity.private_key_pem)?;
    write_pem(&paths.cert_pem, &identity.cert_pem)?;
    info!(cert = %paths.cert_pem.display(), key = %paths.key_pem.display(), "persisted new host identity");
    Ok(identity)
}

fn generate() -> Result<HostIdentity, HostError> {
    let rsa_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| HostError::Fatal(crate::error::FatalError::ConfigParse(format!("RSA keygen failed: {e}"))))?;
    let private_key_pem = rsa_key
        .to_pkcs8_pem(Default::default())
        .map_err(|e| HostError::Fatal(crate::error::FatalError::ConfigParse(format!("PKCS8 encode failed: {e}"))))?
        .to_string();

    let key_pair = KeyPair::from_pem(&private_key_pem)
        .map_err(|e| HostError::Fatal(crate::error::FatalError::ConfigParse(format!("rcgen key load failed: {e}"))))?;

    let mut params = CertificateParams::new(vec!["moonlight-host".to_string()])
        .map_err(|e| HostError::Fatal(crate::error::FatalError::ConfigParse(format!("cert params failed: {e}"))))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "moonlight-host");
    params.distinguished_name = dn;
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc() + Duration::days(365 * VALIDITY_YEARS);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| HostError::Fatal(crate::error::FatalError::ConfigParse(format!("self-sign failed: {e}"))))?;

    let cert_der = cert.der().to_vec();
    let cert_pem = cert.pem();

    Ok(HostIdentity {
        cert_pem,
        cert_der,
        private_key_pem,
    })
}

fn write_pem(path: &Path, contents: &str) -> Result<(), HostError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(HostError::Io)?;
    }
    std::fs::write(path, contents).map_err(HostError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_reloads_identical_identity() {
        let dir = std::env::temp_dir().join(format!("moonlight-host-identity-test-{}", uuid::Uuid::new_v4()));
        let paths = IdentityPaths {
            cert_pem: dir.join("host.pem"),
            key_pem: dir.join("host.key"),
        };

        let first = load_or_generate(&paths).unwrap();
        let second = load_or_generate(&paths).unwrap();
        assert_eq!(first.cert_der, second.cert_der);
        assert_eq!(first.private_key_pem, second.private_key_pem);

        std::fs::remove_dir_all(&dir).ok();
    }
}
