//! mTLS server setup for the HTTPS listener.
//!
//! Mirrors `identity.rs`/`cosmic-rdp-server`'s self-signed-certificate
//! pattern for the *server* side of the handshake; the *client* side needs
//! a verifier that accepts the certificate Moonlight clients present
//! (self-signed, often clock-skewed) and defers the actual trust decision
//! to `PairingService::find_paired` after the handshake completes, matching
//! the lenient policy already implemented in `crypto::x509::verify_chain`.

use std::sync::Arc;

use rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, HandshakeSignatureValid, WebPkiSupportedAlgorithms,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio_rustls::TlsAcceptor;

use crate::error::{FatalError, HostError};
use crate::pairing::HostIdentity;

/// Accepts any client certificate at the handshake layer; proof of key
/// possession is still checked cryptographically, but chain-of-trust and
/// validity-window checks are skipped on purpose (see module docs).
#[derive(Debug)]
struct AcceptAnyClientCert {
    supported_algs: WebPkiSupportedAlgorithms,
}

impl AcceptAnyClientCert {
    fn new() -> Self {
        Self {
            supported_algs: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

/// Build the `TlsAcceptor` for the HTTPS (mTLS) listener from the host's
/// persisted identity. Built once at startup: the verifier itself does not
/// depend on the current paired-client set, so there is no need to rebuild
/// per connection or per pairing change.
pub fn build_https_acceptor(identity: &HostIdentity) -> Result<TlsAcceptor, HostError> {
    let mut cert_reader = std::io::BufReader::new(identity.cert_pem.as_bytes());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| HostError::Fatal(FatalError::ConfigParse(format!("bad host certificate PEM: {e}"))))?;

    let mut key_reader = std::io::BufReader::new(identity.private_key_pem.as_bytes());
    let key_der: PrivatePkcs8KeyDer<'static> = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .next()
        .ok_or_else(|| HostError::Fatal(FatalError::ConfigParse("no PKCS8 private key found".into())))?
        .map_err(|e| HostError::Fatal(FatalError::ConfigParse(format!("bad host private key PEM: {e}"))))?;
    let key = PrivateKeyDer::Pkcs8(key_der);

    let verifier: Arc<dyn ClientCertVerifier> = Arc::new(AcceptAnyClientCert::new());
    let server_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| HostError::Fatal(FatalError::ConfigParse(format!("bad certificate/key: {e}"))))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
