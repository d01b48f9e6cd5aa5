//! Audio RTP payloader: fixed 4-data/2-parity FEC geometry, AES-128-CBC
//! encryption with a per-packet derived IV, 5ms timestamp cadence.
//!
//! Audio packets carry no Moonlight header (unlike video); just the RTP
//! header followed by the encrypted Opus frame, so they use a dedicated
//! packet type rather than [`crate::rtp::RtpPacket`].

use crate::crypto;
use crate::error::HostError;
use crate::fec;
use crate::rtp::{RtpHeader, RTP_HEADER_SIZE};

pub const AUDIO_DATA_SHARDS: usize = 4;
pub const AUDIO_FEC_SHARDS: usize = 2;
pub const AUDIO_PACKET_TYPE: u8 = 97;
pub const AUDIO_TIMESTAMP_STEP: u32 = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct AudioStreamState {
    pub cur_seq_number: u32,
    pub timestamp: u32,
}

#[derive(Debug, Clone)]
pub struct AudioRtpPacket {
    pub rtp: RtpHeader,
    pub payload: Vec<u8>,
}

impl AudioRtpPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RTP_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.rtp.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

fn derive_iv(aes_iv: &[u8; 16], sequence_number: u32) -> [u8; 16] {
    let mut iv = *aes_iv;
    let base = u32::from_le_bytes([iv[0], iv[1], iv[2], iv[3]]);
    let derived = base.wrapping_add(sequence_number);
    iv[0..4].copy_from_slice(&derived.to_le_bytes());
    iv
}

/// Holds the rolling buffer of encrypted data shards awaiting their FEC
/// group's parity computation.
pub struct AudioPayloader {
    shards: Vec<Vec<u8>>,
}

impl AudioPayloader {
    pub fn new() -> Self {
        Self {
            shards: Vec::with_capacity(AUDIO_DATA_SHARDS),
        }
    }

    /// Encrypt one Opus frame, emit its data packet, and — every
    /// [`AUDIO_DATA_SHARDS`]th frame — the FEC parity packets for the
    /// just-completed group.
    pub fn payload_frame(
        &mut self,
        opus_frame: &[u8],
        aes_key: &[u8; 16],
        aes_iv: &[u8; 16],
        state: &mut AudioStreamState,
    ) -> Result<Vec<AudioRtpPacket>, HostError> {
        let seq = state.cur_seq_number;
        let iv = derive_iv(aes_iv, seq);
        let ciphertext = crypto::aes128_cbc(aes_key, &iv, opus_frame, true, false)?;

        let rtp = RtpHeader::new(AUDIO_PACKET_TYPE, seq as u16, state.timestamp);
        let mut out = vec![AudioRtpPacket {
            rtp,
            payload: ciphertext.clone(),
        }];

        self.shards.push(ciphertext);
        state.cur_seq_number += 1;
        state.timestamp += AUDIO_TIMESTAMP_STEP;

        if self.shards.len() == AUDIO_DATA_SHARDS {
            let max_len = self.shards.iter().map(Vec::len).max().unwrap_or(0);
            let mut group: Vec<Vec<u8>> = self
                .shards
                .drain(..)
                .map(|mut s| {
                    s.resize(max_len, 0);
                    s
                })
                .collect();
            for _ in 0..AUDIO_FEC_SHARDS {
                group.push(vec![0u8; max_len]);
            }
            fec::encode(&mut group, AUDIO_DATA_SHARDS, AUDIO_FEC_SHARDS)?;

            for parity in group.into_iter().skip(AUDIO_DATA_SHARDS) {
                let seq = state.cur_seq_number;
                let rtp = RtpHeader::new(AUDIO_PACKET_TYPE, seq as u16, state.timestamp);
                out.push(AudioRtpPacket { rtp, payload: parity });
                state.cur_seq_number += 1;
            }
        }

        Ok(out)
    }
}

impl Default for AudioPayloader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_and_iv() -> ([u8; 16], [u8; 16]) {
        ([0x11; 16], [0x22; 16])
    }

    #[test]
    fn iv_derivation_varies_by_sequence() {
        let (_, iv) = key_and_iv();
        let iv0 = derive_iv(&iv, 0);
        let iv1 = derive_iv(&iv, 1);
        assert_ne!(iv0, iv1);
        assert_eq!(&iv0[4..], &iv[4..]);
    }

    #[test]
    fn sequence_and_timestamp_advance_per_frame() {
        let (key, iv) = key_and_iv();
        let mut payloader = AudioPayloader::new();
        let mut state = AudioStreamState::default();
        let frame = vec![0x42u8; 16];

        payloader.payload_frame(&frame, &key, &iv, &mut state).unwrap();
        assert_eq!(state.cur_seq_number, 1);
        assert_eq!(state.timestamp, AUDIO_TIMESTAMP_STEP);

        payloader.payload_frame(&frame, &key, &iv, &mut state).unwrap();
        assert_eq!(state.cur_seq_number, 2);
        assert_eq!(state.timestamp, 2 * AUDIO_TIMESTAMP_STEP);
    }

    #[test]
    fn fec_parity_emitted_every_fourth_frame() {
        let (key, iv) = key_and_iv();
        let mut payloader = AudioPayloader::new();
        let mut state = AudioStreamState::default();
        let frame = vec![0x7Eu8; 16];

        for _ in 0..3 {
            let packets = payloader.payload_frame(&frame, &key, &iv, &mut state).unwrap();
            assert_eq!(packets.len(), 1);
        }
        let packets = payloader.payload_frame(&frame, &key, &iv, &mut state).unwrap();
        assert_eq!(packets.len(), 1 + AUDIO_FEC_SHARDS);
        assert!(payloader.shards.is_empty());
    }

    #[test]
    fn ciphertext_round_trips_through_cbc() {
        let (key, iv) = key_and_iv();
        let mut payloader = AudioPayloader::new();
        let mut state = AudioStreamState::default();
        let frame = vec![0xAAu8; 32];

        let packets = payloader.payload_frame(&frame, &key, &iv, &mut state).unwrap();
        let derived_iv = derive_iv(&iv, 0);
        let plaintext =
            crypto::aes128_cbc(&key, &derived_iv, &packets[0].payload, false, false).unwrap();
        assert_eq!(plaintext, frame);
    }
}
