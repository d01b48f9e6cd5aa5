//! RTSP TCP listener. One receive / dispatch / respond cycle per
//! connection, then close — matches observed Moonlight client behaviour
//! rather than conformant RTSP keepalive (see DESIGN.md's Open Question
//! decisions).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::control::CONTROL_PORT;
use crate::error::HostError;
use crate::rtsp::{self, RtspPacket, RtspTarget};
use crate::session::coordinator::SessionCoordinator;
use crate::session::{AudioSession, SessionEvent, VideoCodec, VideoSession};

const READ_DEADLINE: Duration = Duration::from_millis(2500);
const RTSP_SESSION_ID: &str = "DEADBEEFCAFE";

pub struct RtspServer {
    coordinator: Arc<SessionCoordinator>,
    support_hevc: bool,
    support_av1: bool,
}

impl RtspServer {
    pub fn new(coordinator: Arc<SessionCoordinator>, support_hevc: bool, support_av1: bool) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            support_hevc,
            support_av1,
        })
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), HostError> {
        loop {
            let (stream, addr) = listener.accept().await.map_err(HostError::Io)?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream).await {
                    warn!(%addr, error = %e, "rtsp connection error");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), HostError> {
        let peer = stream.peer_addr().map_err(HostError::Io)?;
        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];

        loop {
            let read = tokio::time::timeout(READ_DEADLINE, stream.read(&mut chunk))
                .await
                .map_err(|_| HostError::Timeout(crate::error::TimeoutError::RtspRead(READ_DEADLINE)))?
                .map_err(HostError::Io)?;
            if read == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..read]);
            if rtsp::has_complete_frame(&buf) {
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf).into_owned();
        let response = self.dispatch(&text, peer.ip());
        let wire = rtsp::serialise(&response);

        stream.write_all(wire.as_bytes()).await.map_err(HostError::Io)?;
        stream.shutdown().await.map_err(HostError::Io)?;
        Ok(())
    }

    fn dispatch(&self, text: &str, peer_ip: std::net::IpAddr) -> RtspPacket {
        let Some(RtspPacket::Request {
            command,
            target,
            cseq,
            payloads,
            ..
        }) = rtsp::parse(text)
        else {
            return not_found(0);
        };

        match command.as_str() {
            "OPTIONS" => ok(cseq, BTreeMap::new(), Vec::new()),
            "DESCRIBE" => ok(cseq, BTreeMap::new(), self.describe_payloads()),
            "SETUP" => self.handle_setup(cseq, &target, peer_ip),
            "ANNOUNCE" => self.handle_announce(cseq, &payloads, peer_ip),
            "PLAY" => ok(cseq, BTreeMap::new(), Vec::new()),
            _ => not_found(cseq),
        }
    }

    fn describe_payloads(&self) -> Vec<(String, String)> {
        let mut lines = Vec::new();
        if self.support_hevc {
            lines.push(("a".into(), "sprop-parameter-sets:AAAAAAAAAA==".into()));
        }
        if self.support_av1 {
            lines.push(("a".into(), "rtpmap:98 AV1/90000".into()));
        }
        for (index, mapping) in ["stereo", "5.1", "7.1"].iter().enumerate() {
            let speakers = rotated_speaker_mapping(index);
            lines.push(("a".into(), format!("fmtp:97 surround-params={mapping};{speakers}")));
        }
        lines.push(("x-ss-general.featureFlags".into(), "3".into()));
        lines
    }

    fn handle_setup(&self, cseq: u32, target: &RtspTarget, peer_ip: std::net::IpAddr) -> RtspPacket {
        let Some(session) = self.coordinator.find_by_ip(&peer_ip) else {
            return not_found(cseq);
        };
        let RtspTarget::Stream { stream_type, .. } = target else {
            return not_found(cseq);
        };
        let port = match stream_type.as_str() {
            "video" => session.video_stream_port,
            "audio" => session.audio_stream_port,
            "control" => CONTROL_PORT,
            _ => return not_found(cseq),
        };

        let mut options = BTreeMap::new();
        options.insert("Transport".into(), format!("server_port={port}"));
        options.insert("Session".into(), format!("{RTSP_SESSION_ID};timeout = 90"));
        ok(cseq, options, Vec::new())
    }

    fn handle_announce(
        &self,
        cseq: u32,
        payloads: &[(String, String)],
        peer_ip: std::net::IpAddr,
    ) -> RtspPacket {
        let Some(session) = self.coordinator.find_by_ip(&peer_ip) else {
            return not_found(cseq);
        };

        let attrs: BTreeMap<&str, &str> = payloads
            .iter()
            .filter_map(|(k, v)| (k == "a").then(|| v.split_once(':')).flatten())
            .collect();

        let bit_stream_format: u32 = attrs.get("bitStreamFormat").and_then(|v| v.parse().ok()).unwrap_or(0);
        let codec = match bit_stream_format {
            1 => VideoCodec::Hevc,
            2 => VideoCodec::Av1,
            _ => VideoCodec::H264,
        };

        let max_bitrate: u32 = attrs
            .get("bw.maximumBitrateKbps")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let configured_bitrate: Option<u32> = attrs.get("bw.configuredBitrateKbps").and_then(|v| v.parse().ok());
        let fec_pct = attrs.get("fec.percentage").and_then(|v| v.parse().ok()).unwrap_or(20u32);
        let min_required_fec_packets = attrs
            .get("fec.minRequiredFecPackets")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let slices_per_frame = attrs
            .get("videoEncoderSlicesPerFrame")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let csc_mode: u32 = attrs.get("encoderCscMode").and_then(|v| v.parse().ok()).unwrap_or(0);
        let packet_size: u32 = attrs.get("packetSize").and_then(|v| v.parse().ok()).unwrap_or(1024);

        let bitrate_kbps = compute_bitrate_kbps(max_bitrate, configured_bitrate, fec_pct, session.audio_channel_count);

        let video = VideoSession {
            session_id: session.session_id,
            width: session.display_width,
            height: session.display_height,
            fps: session.display_fps,
            codec,
            bitrate_kbps,
            packet_size,
            fec_percentage: 20,
            min_required_fec_packets,
            slices_per_frame,
            color_range_jpeg: csc_mode & 1 != 0,
            color_space: csc_mode >> 1,
        };
        let audio = AudioSession {
            session_id: session.session_id,
            channel_count: session.audio_channel_count,
            bitrate_kbps: 96 * session.audio_channel_count as u32,
        };

        let bus = self.coordinator.event_bus();
        bus.publish(SessionEvent::VideoSession(video));
        bus.publish(SessionEvent::AudioSession(audio));

        ok(cseq, BTreeMap::new(), Vec::new())
    }
}

/// `bitrate_kbps = max(maximumBitrateKbps, configuredBitrateKbps)`, then —
/// only when `configuredBitrateKbps` was actually present — reduced for
/// FEC overhead, per-channel audio overhead (capped 20%), and fixed packet
/// overhead (capped 10%).
fn compute_bitrate_kbps(max_bitrate: u32, configured_bitrate: Option<u32>, fec_pct: u32, channels: u8) -> u32 {
    let mut bitrate = max_bitrate.max(configured_bitrate.unwrap_or(0));
    let Some(_) = configured_bitrate else {
        return bitrate;
    };

    if fec_pct <= 80 {
        bitrate = bitrate * (100 - fec_pct) / 100;
    }
    let audio_overhead = (96 * channels as u32).min(bitrate / 5);
    bitrate = bitrate.saturating_sub(audio_overhead);
    let packet_overhead = 500u32.min(bitrate / 10);
    bitrate.saturating_sub(packet_overhead)
}

/// Rotate the canonical speaker-mapping string left by one starting at
/// index 3, working around the client-side parsing bug described in §4.2.
fn rotated_speaker_mapping(config_index: usize) -> String {
    let speakers: &[&str] = match config_index {
        0 => &["FL", "FR"],
        1 => &["FL", "FR", "C", "LFE", "RL", "RR"],
        _ => &["FL", "FR", "C", "LFE", "RL", "RR", "SL", "SR"],
    };
    if speakers.len() <= 3 {
        return speakers.join(",");
    }
    let mut rotated = speakers.to_vec();
    rotated[3..].rotate_left(1);
    rotated.join(",")
}

fn ok(cseq: u32, options: BTreeMap<String, String>, payloads: Vec<(String, String)>) -> RtspPacket {
    RtspPacket::Response {
        status_code: 200,
        message: "OK".into(),
        cseq,
        options,
        payloads,
    }
}

fn not_found(cseq: u32) -> RtspPacket {
    RtspPacket::Response {
        status_code: 404,
        message: "NOT FOUND".into(),
        cseq,
        options: BTreeMap::new(),
        payloads: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::NullRunner;
    use crate::session::{EventBus, StreamSession};
    use std::sync::atomic::AtomicU32;

    fn coordinator_with_session(port_video: u16, port_audio: u16, ip: &str) -> Arc<SessionCoordinator> {
        let coordinator = SessionCoordinator::new(Arc::new(EventBus::new()), Arc::new(NullRunner));
        let session = StreamSession {
            session_id: StreamSession::next_id(),
            display_width: 1920,
            display_height: 1080,
            display_fps: 60,
            support_hevc: false,
            support_av1: false,
            audio_channel_count: 2,
            aes_key: [0u8; 16],
            aes_iv: [0u8; 16],
            client_ip: ip.parse().unwrap(),
            app_id: 1,
            video_stream_port: port_video,
            audio_stream_port: port_audio,
            input_devices: parking_lot::Mutex::new(Default::default()),
            virtual_display: None,
            last_control_seq: AtomicU32::new(0),
        };
        // `start_session` spawns a runner task; acceptable in a unit test
        // since NullRunner returns immediately.
        tokio::runtime::Handle::current().block_on(async {
            let runner = coordinator.default_runner();
            coordinator
                .start_session(session, BTreeMap::new(), "/tmp".into(), "/dev/dri/renderD128".into(), runner)
                .await
                .unwrap();
        });
        coordinator
    }

    #[tokio::test]
    async fn s3_options_returns_200() {
        let coordinator = SessionCoordinator::new(Arc::new(EventBus::new()), Arc::new(NullRunner));
        let server = RtspServer::new(coordinator, true, false);
        let response = server.dispatch(
            "OPTIONS rtsp://10.1.2.49:48010 RTSP/1.0\r\nCSeq: 1\r\n\r\n",
            "127.0.0.1".parse().unwrap(),
        );
        match response {
            RtspPacket::Response { status_code, cseq, .. } => {
                assert_eq!(status_code, 200);
                assert_eq!(cseq, 1);
            }
            _ => panic!("expected response"),
        }
    }

    #[tokio::test]
    async fn s4_setup_video_returns_port_and_session() {
        let coordinator = coordinator_with_session(48100, 48200, "127.0.0.1");
        let server = RtspServer::new(coordinator, true, false);
        let response = server.dispatch(
            "SETUP streamid=video/0/0 RTSP/1.0\r\nCSeq: 4\r\nSession: DEADBEEFCAFE\r\n\r\n",
            "127.0.0.1".parse().unwrap(),
        );
        match response {
            RtspPacket::Response {
                status_code, options, ..
            } => {
                assert_eq!(status_code, 200);
                assert_eq!(options.get("Transport").unwrap(), "server_port=48100");
                assert_eq!(options.get("Session").unwrap(), "DEADBEEFCAFE;timeout = 90");
            }
            _ => panic!("expected response"),
        }
    }

    #[tokio::test]
    async fn setup_for_unknown_peer_is_404() {
        let coordinator = SessionCoordinator::new(Arc::new(EventBus::new()), Arc::new(NullRunner));
        let server = RtspServer::new(coordinator, true, false);
        let response = server.dispatch(
            "SETUP streamid=video/0/0 RTSP/1.0\r\nCSeq: 4\r\n\r\n",
            "203.0.113.9".parse().unwrap(),
        );
        assert!(matches!(response, RtspPacket::Response { status_code: 404, .. }));
    }

    #[tokio::test]
    async fn unknown_command_is_404() {
        let coordinator = SessionCoordinator::new(Arc::new(EventBus::new()), Arc::new(NullRunner));
        let server = RtspServer::new(coordinator, true, false);
        let response = server.dispatch("TEARDOWN / RTSP/1.0\r\nCSeq: 2\r\n\r\n", "127.0.0.1".parse().unwrap());
        assert!(matches!(response, RtspPacket::Response { status_code: 404, .. }));
    }
}
