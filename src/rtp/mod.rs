//! RTP payload formatting: Moonlight's specific packetisation of a
//! compressed bitstream, including multi-block Reed-Solomon FEC and
//! sequence-number discipline.

pub mod audio;
pub mod video;

pub const MAX_RTP_HEADER_SIZE: usize = 16;
pub const RTP_HEADER_SIZE: usize = 12;
pub const MOONLIGHT_HEADER_SIZE: usize = 16;
pub const VIDEO_PAYLOAD_HEADER_SIZE: usize = 8;

pub const FLAG_EXTENSION: u8 = 0x10;
pub const FLAG_CONTAINS_PIC_DATA: u8 = 0x1;
pub const FLAG_SOF: u8 = 0x2;
pub const FLAG_EOF: u8 = 0x4;

/// 12-byte RTP header.
#[derive(Debug, Clone, Copy)]
pub struct RtpHeader {
    pub version_flags: u8,
    pub packet_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(packet_type: u8, sequence_number: u16, timestamp: u32) -> Self {
        Self {
            version_flags: 0x80 | FLAG_EXTENSION,
            packet_type,
            sequence_number,
            timestamp,
            ssrc: 0,
        }
    }

    pub fn to_bytes(self) -> [u8; RTP_HEADER_SIZE] {
        let mut out = [0u8; RTP_HEADER_SIZE];
        out[0] = self.version_flags;
        out[1] = self.packet_type;
        out[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        out[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        out
    }
}

/// 16-byte Moonlight header following the RTP header.
#[derive(Debug, Clone, Copy)]
pub struct MoonlightRtpHeader {
    pub frame_index: u32,
    pub stream_packet_index: u32,
    pub multi_fec_flags: u8,
    pub multi_fec_blocks: u8,
    pub fec_info: u32,
    pub flags: u8,
}

impl MoonlightRtpHeader {
    pub fn to_bytes(self) -> [u8; MOONLIGHT_HEADER_SIZE] {
        let mut out = [0u8; MOONLIGHT_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.frame_index.to_le_bytes());
        out[4..8].copy_from_slice(&self.stream_packet_index.to_le_bytes());
        out[8] = self.multi_fec_flags;
        out[9] = self.multi_fec_blocks;
        out[10..14].copy_from_slice(&self.fec_info.to_le_bytes());
        out[14] = self.flags;
        out[15] = 0;
        out
    }
}

/// One formatted RTP packet ready for the wire.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub rtp: RtpHeader,
    pub moonlight: MoonlightRtpHeader,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RTP_HEADER_SIZE + MOONLIGHT_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.rtp.to_bytes());
        out.extend_from_slice(&self.moonlight.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}
