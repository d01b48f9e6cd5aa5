//! ENet-style reliable control channel over UDP: packet framing, the
//! Moonlight packet-type enum, and AES-128-GCM encryption with a
//! sequence-derived IV.
//!
//! A from-scratch ENet implementation is out of scope (see SPEC_FULL.md);
//! this module frames the same wire layout ENet would carry and relies on
//! UDP's own best-effort delivery plus the client's own retransmission,
//! matching the "receiver does not require in-order delivery" invariant.

pub mod server;

use crate::crypto;
use crate::error::{AuthError, HostError, ProtocolError};

pub const CONTROL_PORT: u16 = 47999;

pub const PACKET_TYPE_START_A: u16 = 0x0305;
pub const PACKET_TYPE_START_B: u16 = 0x0307;
pub const PACKET_TYPE_INVALIDATE_REF_FRAMES: u16 = 0x0301;
pub const PACKET_TYPE_LOSS_STATS: u16 = 0x0201;
pub const PACKET_TYPE_FRAME_STATS: u16 = 0x0204;
pub const PACKET_TYPE_INPUT_DATA: u16 = 0x0206;
pub const PACKET_TYPE_TERMINATION: u16 = 0x0109;
pub const PACKET_TYPE_PERIODIC_PING: u16 = 0x0200;
pub const PACKET_TYPE_IDR_FRAME: u16 = 0x0302;
pub const PACKET_TYPE_ENCRYPTED: u16 = 0x0001;
pub const PACKET_TYPE_HDR_MODE: u16 = 0x010e;
pub const PACKET_TYPE_RUMBLE_DATA: u16 = 0x010b;
pub const PACKET_TYPE_RUMBLE_TRIGGERS: u16 = 0x5500;
pub const PACKET_TYPE_MOTION_EVENT: u16 = 0x5501;
pub const PACKET_TYPE_RGB_LED_EVENT: u16 = 0x5502;

/// Sent on server-initiated stop (§4.8 step 5).
pub const TERMINATION_REASON: u32 = 0x80030023;

/// The 4-byte framing header shared by every control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub packet_type: u16,
    /// Excludes these 4 header bytes.
    pub length: u16,
}

impl ControlHeader {
    pub fn to_bytes(self) -> [u8; 4] {
        let mut out = [0u8; 4];
        out[0..2].copy_from_slice(&self.packet_type.to_le_bytes());
        out[2..4].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        Some(Self {
            packet_type: u16::from_le_bytes([buf[0], buf[1]]),
            length: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }
}

/// A decoded nested packet: `(type, payload)` after ENCRYPTED framing is
/// peeled off.
#[derive(Debug, Clone)]
pub struct NestedPacket {
    pub packet_type: u16,
    pub payload: Vec<u8>,
}

fn gcm_iv(seq: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0..4].copy_from_slice(&seq.to_le_bytes());
    iv
}

/// Build one `ControlEncrypted` frame around `nested`.
pub fn encrypt_frame(aes_key: &[u8; 16], seq: u32, nested: &NestedPacket) -> Result<Vec<u8>, HostError> {
    let mut inner = ControlHeader {
        packet_type: nested.packet_type,
        length: nested.payload.len() as u16,
    }
    .to_bytes()
    .to_vec();
    inner.extend_from_slice(&nested.payload);

    let iv = gcm_iv(seq);
    let (ciphertext, tag) = crypto::aes128_gcm_encrypt(aes_key, &iv, &inner)?;

    let outer_length = 4 + 16 + ciphertext.len();
    let mut out = ControlHeader {
        packet_type: PACKET_TYPE_ENCRYPTED,
        length: outer_length as u16,
    }
    .to_bytes()
    .to_vec();
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a raw wire frame into its nested packet. Rejects anything that
/// isn't a well-formed `ENCRYPTED` frame.
pub fn decrypt_frame(aes_key: &[u8; 16], raw: &[u8]) -> Result<NestedPacket, HostError> {
    let header = ControlHeader::from_bytes(raw)
        .ok_or(HostError::ProtocolGrammar(ProtocolError::MalformedControlPacket { field: "header" }))?;
    if header.packet_type != PACKET_TYPE_ENCRYPTED {
        return Err(HostError::AuthFail(AuthError::TagMismatch));
    }
    if raw.len() < 4 + 4 + 16 {
        return Err(HostError::ProtocolGrammar(ProtocolError::MalformedControlPacket {
            field: "length",
        }));
    }
    let seq = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&raw[8..24]);
    let ciphertext = &raw[24..];

    let iv = gcm_iv(seq);
    let plaintext = crypto::aes128_gcm_decrypt(aes_key, &iv, ciphertext, &tag)?;

    let nested_header = ControlHeader::from_bytes(&plaintext).ok_or(HostError::ProtocolGrammar(
        ProtocolError::MalformedControlPacket { field: "nested_header" },
    ))?;
    let nested_payload = plaintext
        .get(4..4 + nested_header.length as usize)
        .ok_or(HostError::ProtocolGrammar(ProtocolError::MalformedControlPacket {
            field: "nested_payload",
        }))?
        .to_vec();

    Ok(NestedPacket {
        packet_type: nested_header.packet_type,
        payload: nested_payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [0x5Au8; 16];
        let nested = NestedPacket {
            packet_type: PACKET_TYPE_INPUT_DATA,
            payload: vec![1, 2, 3, 4],
        };
        let frame = encrypt_frame(&key, 42, &nested).unwrap();
        let decoded = decrypt_frame(&key, &frame).unwrap();
        assert_eq!(decoded.packet_type, PACKET_TYPE_INPUT_DATA);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn tampered_frame_fails_tag_check() {
        let key = [0x5Au8; 16];
        let nested = NestedPacket {
            packet_type: PACKET_TYPE_TERMINATION,
            payload: vec![],
        };
        let mut frame = encrypt_frame(&key, 1, &nested).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(decrypt_frame(&key, &frame).is_err());
    }

    #[test]
    fn distinct_sequence_numbers_produce_distinct_ciphertext() {
        let key = [0x11u8; 16];
        let nested = NestedPacket {
            packet_type: PACKET_TYPE_PERIODIC_PING,
            payload: vec![9, 9, 9],
        };
        let a = encrypt_frame(&key, 1, &nested).unwrap();
        let b = encrypt_frame(&key, 2, &nested).unwrap();
        assert_ne!(a, b);
    }
}
