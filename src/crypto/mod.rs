//! Crypto primitives shared by pairing and the control channel.
//!
//! All operations return `Result`; nothing here panics or lets an
//! exception cross a component boundary (a malformed key or ciphertext
//! is a value, never a process abort).

pub mod x509;

use aes::Aes128;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, NONCE_LEN};
use ring::digest;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{pkcs1v15, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::{AuthError, HostError, ProtocolError};

pub const AES_KEY_LEN: usize = 16;
pub const GCM_TAG_LEN: usize = 16;

type Aes128EcbEnc = ecb::Encryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// SHA-256 digest.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let digest = digest::digest(&digest::SHA256, bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

/// CSPRNG bytes.
pub fn random(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// AES-128-ECB. `iv` is accepted for API uniformity and ignored.
pub fn aes128_ecb(
    key: &[u8; AES_KEY_LEN],
    data: &[u8],
    encrypt: bool,
    padding: bool,
) -> Result<Vec<u8>, HostError> {
    if encrypt {
        let enc = Aes128EcbEnc::new(key.into());
        Ok(if padding {
            enc.encrypt_padded_vec_mut::<Pkcs7>(data)
        } else {
            enc.encrypt_padded_vec_mut::<NoPadding>(data)
        })
    } else {
        let dec = Aes128EcbDec::new(key.into());
        let result = if padding {
            dec.decrypt_padded_vec_mut::<Pkcs7>(data)
        } else {
            dec.decrypt_padded_vec_mut::<NoPadding>(data)
        };
        result.map_err(|_| HostError::AuthFail(AuthError::TagMismatch))
    }
}

/// AES-128-CBC.
pub fn aes128_cbc(
    key: &[u8; AES_KEY_LEN],
    iv: &[u8; 16],
    data: &[u8],
    encrypt: bool,
    padding: bool,
) -> Result<Vec<u8>, HostError> {
    if encrypt {
        let enc = Aes128CbcEnc::new(key.into(), iv.into());
        Ok(if padding {
            enc.encrypt_padded_vec_mut::<Pkcs7>(data)
        } else {
            enc.encrypt_padded_vec_mut::<NoPadding>(data)
        })
    } else {
        let dec = Aes128CbcDec::new(key.into(), iv.into());
        let result = if padding {
            dec.decrypt_padded_vec_mut::<Pkcs7>(data)
        } else {
            dec.decrypt_padded_vec_mut::<NoPadding>(data)
        };
        result.map_err(|_| HostError::AuthFail(AuthError::TagMismatch))
    }
}

fn gcm_key(key: &[u8; AES_KEY_LEN]) -> Result<LessSafeKey, HostError> {
    let unbound = UnboundKey::new(&AES_128_GCM, key)
        .map_err(|_| HostError::Internal("invalid AES-GCM key length".into()))?;
    Ok(LessSafeKey::new(unbound))
}

fn gcm_nonce(iv: &[u8; 16]) -> Nonce {
    let mut bytes = [0u8; NONCE_LEN];
    bytes.copy_from_slice(&iv[..NONCE_LEN]);
    Nonce::assume_unique_for_key(bytes)
}

/// AES-128-GCM encrypt. Returns `(ciphertext, tag)`.
pub fn aes128_gcm_encrypt(
    key: &[u8; AES_KEY_LEN],
    iv: &[u8; 16],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; GCM_TAG_LEN]), HostError> {
    let key = gcm_key(key)?;
    let nonce = gcm_nonce(iv);
    let mut in_out = plaintext.to_vec();
    let tag = key
        .seal_in_place_separate_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| HostError::Internal("AES-GCM seal failed".into()))?;
    let mut tag_bytes = [0u8; GCM_TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_ref());
    Ok((in_out, tag_bytes))
}

/// AES-128-GCM decrypt. Fails with `AuthFail` on tag mismatch.
pub fn aes128_gcm_decrypt(
    key: &[u8; AES_KEY_LEN],
    iv: &[u8; 16],
    ciphertext: &[u8],
    tag: &[u8; GCM_TAG_LEN],
) -> Result<Vec<u8>, HostError> {
    let key = gcm_key(key)?;
    let nonce = gcm_nonce(iv);
    let mut in_out = ciphertext.to_vec();
    in_out.extend_from_slice(tag);
    let plaintext = key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| HostError::AuthFail(AuthError::TagMismatch))?;
    Ok(plaintext.to_vec())
}

/// RSA-SHA256-PKCS1v1.5 sign over `msg` with a PKCS#8 PEM private key.
pub fn sign(msg: &[u8], rsa_private_key_pem: &str) -> Result<[u8; 256], HostError> {
    let key = RsaPrivateKey::from_pkcs8_pem(rsa_private_key_pem)
        .map_err(|e| HostError::Internal(format!("invalid RSA private key: {e}")))?;
    let signing_key = pkcs1v15::SigningKey::<Sha256>::new(key);
    let signature = signing_key.sign(msg);
    let bytes = signature.to_bytes();
    if bytes.len() != 256 {
        return Err(HostError::Internal(format!(
            "unexpected RSA signature length {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; 256];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// RSA-SHA256-PKCS1v1.5 verify over `msg` with an RSA public key (PKCS1 DER).
pub fn verify_with_public_key(msg: &[u8], signature: &[u8], public_key: &RsaPublicKey) -> bool {
    let verifying_key = pkcs1v15::VerifyingKey::<Sha256>::new(public_key.clone());
    let sig = match pkcs1v15::Signature::try_from(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    verifying_key.verify(msg, &sig).is_ok()
}

/// Hex encode.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Hex decode. Returns `ProtocolGrammar` on malformed hex.
pub fn from_hex(s: &str) -> Result<Vec<u8>, HostError> {
    hex::decode(s).map_err(|_| HostError::ProtocolGrammar(ProtocolError::MalformedRtsp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_derivation_vector() {
        // Spec-mandated derivation vector.
        let salt = from_hex("ff5dc6eda99339a8a0793e216c4257c4").unwrap();
        let pin = b"5338";
        let mut to_hash = salt.clone();
        to_hash.extend_from_slice(pin);
        let digest = sha256(&to_hash);
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        assert_eq!(to_hex(&key).to_uppercase(), "5EA186FFBA663C75AEC82187CE502647");

        let ciphertext = from_hex("c05930ac81d7bd426344235436046018").unwrap();
        let plaintext = aes128_ecb(&key, &ciphertext, false, false).unwrap();
        assert_eq!(to_hex(&plaintext).to_uppercase(), "E3A915CCCB4C60206077D7E9A12316A5");
    }

    #[test]
    fn aes_ecb_round_trip() {
        let key = [0x11u8; 16];
        let plaintext = b"the quick brown fox jumps";
        let ciphertext = aes128_ecb(&key, plaintext, true, true).unwrap();
        let decrypted = aes128_ecb(&key, &ciphertext, false, true).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aes_cbc_round_trip() {
        let key = [0x22u8; 16];
        let iv = [0x01u8; 16];
        let plaintext = b"lazy dog sleeps under the porch";
        let ciphertext = aes128_cbc(&key, &iv, plaintext, true, true).unwrap();
        let decrypted = aes128_cbc(&key, &iv, &ciphertext, false, true).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aes_gcm_round_trip_and_tag_failure() {
        let key = [0x33u8; 16];
        let iv = [0x00u8; 16];
        let plaintext = b"TERMINATION";
        let (ciphertext, tag) = aes128_gcm_encrypt(&key, &iv, plaintext).unwrap();
        let decrypted = aes128_gcm_decrypt(&key, &iv, &ciphertext, &tag).unwrap();
        assert_eq!(decrypted, plaintext);

        let mut bad_tag = tag;
        bad_tag[0] ^= 0xff;
        assert!(aes128_gcm_decrypt(&key, &iv, &ciphertext, &bad_tag).is_err());
    }

    #[test]
    fn sha256_known_vector() {
        let digest = sha256(b"");
        assert_eq!(
            to_hex(&digest),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
