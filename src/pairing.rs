//! Four-phase (plus HTTPS confirmation) mutual pairing handshake.
//!
//! `PairingAttempt`s live in an `ArcSwap` snapshot keyed by
//! `unique_id@client_ip`; successful phase-4 completion persists a
//! `PairedClient` into a second `ArcSwap` snapshot. PIN entry is modelled
//! as an external promise: phase 1 publishes a `PairSignal` event and
//! suspends on a `oneshot` receiver that the HTTP `/pin/` endpoint (or any
//! other pair-signal collaborator) resolves.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::info;

use crate::crypto::{self, x509};
use crate::error::{AuthError, HostError, ProtocolError};
use crate::session::{pairing_cache_key, PairedClient, PairingAttempt, SessionEvent, SharedEventBus};

/// Host identity material needed to answer pairing phases 1-3.
#[derive(Clone)]
pub struct HostIdentity {
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    pub private_key_pem: String,
}

#[derive(Default, Clone)]
struct PairingCache {
    attempts: BTreeMap<String, PairingAttempt>,
}

#[derive(Default, Clone)]
struct PairedClients {
    by_identity: BTreeMap<[u8; 32], PairedClient>,
}

pub struct PairingService {
    identity: HostIdentity,
    bus: SharedEventBus,
    attempts: ArcSwap<PairingCache>,
    paired: ArcSwap<PairedClients>,
    pin_waiters: AsyncMutex<BTreeMap<String, oneshot::Sender<String>>>,
}

impl PairingService {
    pub fn new(identity: HostIdentity, bus: SharedEventBus) -> Arc<Self> {
        Arc::new(Self {
            identity,
            bus,
            attempts: ArcSwap::from_pointee(PairingCache::default()),
            paired: ArcSwap::from_pointee(PairedClients::default()),
            pin_waiters: AsyncMutex::new(BTreeMap::new()),
        })
    }

    pub fn find_paired(&self, client_cert_der: &[u8]) -> Option<PairedClient> {
        let hash = crypto::sha256(client_cert_der);
        self.paired.load().by_identity.get(&hash).cloned()
    }

    pub fn unpair(&self, client_cert_der: &[u8]) {
        let hash = crypto::sha256(client_cert_der);
        let current = self.paired.load();
        if !current.by_identity.contains_key(&hash) {
            return;
        }
        let mut updated = (**current).clone();
        updated.by_identity.remove(&hash);
        self.paired.store(Arc::new(updated));
    }

    /// `GET /unpair?uniqueid=…` on the plaintext listener has no client
    /// certificate to identify by; it relies on the same `uniqueid@ip`
    /// pairing-cache entry phase 1-4 populated (still present until phase 5
    /// clears it over HTTPS), matching the original's `/unpair` handler.
    pub fn unpair_by_cache_key(&self, unique_id: &str, client_ip: IpAddr) -> Option<PairedClient> {
        let cache_key = pairing_cache_key(unique_id, &client_ip);
        let attempt = self.attempts.load().attempts.get(&cache_key).cloned()?;
        let removed = self.find_paired(&attempt.client_cert_der);
        self.unpair(&attempt.client_cert_der);
        removed
    }

    fn store_attempt(&self, cache_key: &str, attempt: PairingAttempt) {
        let current = self.attempts.load();
        let mut updated = (**current).clone();
        updated.attempts.insert(cache_key.to_string(), attempt);
        self.attempts.store(Arc::new(updated));
    }

    fn get_attempt(&self, cache_key: &str) -> Result<PairingAttempt, HostError> {
        self.attempts
            .load()
            .attempts
            .get(cache_key)
            .cloned()
            .ok_or(HostError::AuthFail(AuthError::UnknownClient))
    }

    fn drop_attempt(&self, cache_key: &str) {
        let current = self.attempts.load();
        if !current.attempts.contains_key(cache_key) {
            return;
        }
        let mut updated = (**current).clone();
        updated.attempts.remove(cache_key);
        self.attempts.store(Arc::new(updated));
    }

    /// Resolve a pending PIN-entry promise identified by `secret`. Called
    /// from the `/pin/` POST handler. Returns `false` if no such promise
    /// is pending (already resolved, or never registered).
    pub async fn submit_pin(&self, secret: &str, pin: String) -> bool {
        let sender = self.pin_waiters.lock().await.remove(secret);
        match sender {
            Some(tx) => tx.send(pin).is_ok(),
            None => false,
        }
    }

    /// Phase 1 — `GET /pair?uniqueid&salt&clientcert&phrase=getservercert`.
    /// Suspends until the PIN promise resolves.
    pub async fn phase1_get_server_cert(
        &self,
        unique_id: &str,
        client_ip: IpAddr,
        salt_hex: &str,
        client_cert_hex: &str,
    ) -> Result<String, HostError> {
        let cache_key = pairing_cache_key(unique_id, &client_ip);
        let salt = crypto::from_hex(salt_hex)?;
        let client_cert_der = hex_decode_cert(client_cert_hex)?;

        let (tx, rx) = oneshot::channel();
        self.pin_waiters.lock().await.insert(cache_key.clone(), tx);
        self.bus.publish(SessionEvent::PairSignal {
            cache_key: cache_key.clone(),
        });
        info!(unique_id, %client_ip, "pairing phase 1: awaiting operator PIN entry");

        let pin = rx
            .await
            .map_err(|_| HostError::AuthFail(AuthError::UnknownClient))?;

        let mut salted = salt;
        salted.extend_from_slice(pin.as_bytes());
        let digest = crypto::sha256(&salted);
        let mut aes_key = [0u8; 16];
        aes_key.copy_from_slice(&digest[0..16]);

        self.store_attempt(
            &cache_key,
            PairingAttempt {
                client_cert_der,
                aes_key,
                server_secret: None,
                server_challenge: None,
                client_hash: None,
                phase: 1,
            },
        );

        Ok(crypto::to_hex(self.identity.cert_pem.as_bytes()))
    }

    /// Phase 2 — `GET /pair?clientchallenge=<hex>`.
    pub fn phase2_client_challenge(
        &self,
        unique_id: &str,
        client_ip: IpAddr,
        client_challenge_hex: &str,
    ) -> Result<String, HostError> {
        let cache_key = pairing_cache_key(unique_id, &client_ip);
        let mut attempt = self.get_attempt(&cache_key)?;

        let encrypted = crypto::from_hex(client_challenge_hex)?;
        let decrypted = crypto::aes128_ecb(&attempt.aes_key, &encrypted, false, false)?;

        let host_signature = x509::signature(&self.identity.cert_der)?;

        let server_secret: [u8; 16] = crypto::random(16).try_into().unwrap();
        let server_challenge: [u8; 16] = crypto::random(16).try_into().unwrap();

        let mut to_hash = decrypted;
        to_hash.extend_from_slice(&host_signature);
        to_hash.extend_from_slice(&server_secret);
        let hash = crypto::sha256(&to_hash);

        let mut plaintext = hash.to_vec();
        plaintext.extend_from_slice(&server_challenge);
        let response = crypto::aes128_ecb(&attempt.aes_key, &plaintext, true, false)?;

        attempt.server_secret = Some(server_secret);
        attempt.server_challenge = Some(server_challenge);
        attempt.phase = 2;
        self.store_attempt(&cache_key, attempt);

        Ok(crypto::to_hex(&response))
    }

    /// Phase 3 — `GET /pair?serverchallengeresp=<hex>`.
    pub fn phase3_server_challenge_response(
        &self,
        unique_id: &str,
        client_ip: IpAddr,
        server_challenge_resp_hex: &str,
    ) -> Result<String, HostError> {
        let cache_key = pairing_cache_key(unique_id, &client_ip);
        let mut attempt = self.get_attempt(&cache_key)?;
        let server_secret = attempt
            .server_secret
            .ok_or(HostError::AuthFail(AuthError::UnknownClient))?;

        let encrypted = crypto::from_hex(server_challenge_resp_hex)?;
        let decrypted = crypto::aes128_ecb(&attempt.aes_key, &encrypted, false, false)?;
        if decrypted.len() != 32 {
            return Err(HostError::ProtocolGrammar(ProtocolError::MalformedPairRequest {
                field: "serverchallengeresp",
            }));
        }
        let mut client_hash = [0u8; 32];
        client_hash.copy_from_slice(&decrypted);

        let signature = crypto::sign(&server_secret, &self.identity.private_key_pem)?;
        let mut body = server_secret.to_vec();
        body.extend_from_slice(&signature);

        attempt.client_hash = Some(client_hash);
        attempt.phase = 3;
        self.store_attempt(&cache_key, attempt);

        Ok(crypto::to_hex(&body))
    }

    /// Phase 4 — `GET /pair?clientpairingsecret=<hex>`. Persists a
    /// `PairedClient` into the in-memory cache on success and returns it so
    /// the caller can persist it into the TOML config too.
    pub fn phase4_client_pairing_secret(
        &self,
        unique_id: &str,
        client_ip: IpAddr,
        client_pairing_secret_hex: &str,
        app_state_folder: String,
        run_uid: u32,
        run_gid: u32,
    ) -> Result<Option<PairedClient>, HostError> {
        let cache_key = pairing_cache_key(unique_id, &client_ip);
        let attempt = self.get_attempt(&cache_key)?;
        let server_challenge = attempt
            .server_challenge
            .ok_or(HostError::AuthFail(AuthError::UnknownClient))?;
        let client_hash = attempt
            .client_hash
            .ok_or(HostError::AuthFail(AuthError::UnknownClient))?;

        let decoded = crypto::from_hex(client_pairing_secret_hex)?;
        if decoded.len() != 16 + 256 {
            return Err(HostError::ProtocolGrammar(ProtocolError::MalformedPairRequest {
                field: "clientpairingsecret",
            }));
        }
        let client_secret = &decoded[0..16];
        let client_signature = &decoded[16..272];

        let cert_signature = x509::signature(&attempt.client_cert_der)?;
        let mut to_hash = server_challenge.to_vec();
        to_hash.extend_from_slice(&cert_signature);
        to_hash.extend_from_slice(client_secret);
        let expected_hash = crypto::sha256(&to_hash);

        if expected_hash != client_hash {
            self.drop_attempt(&cache_key);
            return Ok(None);
        }

        let public_key = x509::public_key(&attempt.client_cert_der)?;
        if !crypto::verify_with_public_key(client_secret, client_signature, &public_key) {
            self.drop_attempt(&cache_key);
            return Ok(None);
        }

        let client_cert_pem = pem_encode_cert(&attempt.client_cert_der);
        let paired = PairedClient {
            client_cert_pem,
            app_state_folder,
            run_uid,
            run_gid,
        };
        let identity = paired.identity();
        let current = self.paired.load();
        let mut updated = (**current).clone();
        updated.by_identity.insert(identity, paired.clone());
        self.paired.store(Arc::new(updated));

        Ok(Some(paired))
    }

    /// Phase 5 — `GET /pair?phrase=pairchallenge` over HTTPS. The client
    /// certificate has already been matched at the TLS layer; this just
    /// confirms and drops the now-unneeded `PairingAttempt`.
    pub fn phase5_confirm(&self, unique_id: &str, client_ip: IpAddr, client_cert_der: &[u8]) -> bool {
        let cache_key = pairing_cache_key(unique_id, &client_ip);
        self.drop_attempt(&cache_key);
        self.find_paired(client_cert_der).is_some()
    }
}

fn hex_decode_cert(hex_str: &str) -> Result<Vec<u8>, HostError> {
    crypto::from_hex(hex_str)
}

fn pem_encode_cert(der: &[u8]) -> String {
    use base64::Engine;
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity() -> HostIdentity {
        // A throwaway self-signed identity good enough to drive phases 2-3;
        // cert parsing is exercised separately in `crypto::x509`'s tests.
        HostIdentity {
            cert_pem: "-----BEGIN CERTIFICATE-----\ntest\n-----END CERTIFICATE-----\n".into(),
            cert_der: vec![0xDE, 0xAD, 0xBE, 0xEF],
            private_key_pem: String::new(),
        }
    }

    #[tokio::test]
    async fn phase1_suspends_until_pin_resolves_then_derives_key() {
        let identity = test_identity();
        let bus = Arc::new(crate::session::EventBus::new());
        let service = PairingService::new(identity, bus.clone());
        let mut sub = bus.subscribe();

        let client_ip: IpAddr = "127.0.0.1".parse().unwrap();
        let salt_hex = "ff5dc6eda99339a8a0793e216c4257c4";
        let client_cert_hex = "deadbeef";

        let service_clone = service.clone();
        let handle = tokio::spawn(async move {
            service_clone
                .phase1_get_server_cert("uid-1", client_ip, salt_hex, client_cert_hex)
                .await
        });

        let cache_key = match sub.recv().await {
            Some(SessionEvent::PairSignal { cache_key }) => cache_key,
            other => panic!("expected PairSignal, got {other:?}"),
        };
        assert_eq!(cache_key, "uid-1@127.0.0.1");

        assert!(service.submit_pin(&cache_key, "5338".to_string()).await);
        let server_cert_hex = handle.await.unwrap().unwrap();
        assert_eq!(server_cert_hex, crypto::to_hex(test_identity().cert_pem.as_bytes()));

        let attempt = service.get_attempt(&cache_key).unwrap();
        assert_eq!(
            crypto::to_hex(&attempt.aes_key).to_uppercase(),
            "5EA186FFBA663C75AEC82187CE502647"
        );
    }

    #[test]
    fn unknown_cache_key_is_rejected() {
        let service = PairingService::new(test_identity(), Arc::new(crate::session::EventBus::new()));
        let err = service.phase2_client_challenge("nope", "127.0.0.1".parse().unwrap(), "00");
        assert!(err.is_err());
    }
}
